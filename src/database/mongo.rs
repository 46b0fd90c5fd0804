//! MongoDB database wrapper and snapshot backend.

use futures::future::{BoxFuture, FutureExt};
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::SnapshotStore;

/// Database wrapper for MongoDB operations.
#[derive(Debug, Clone)]
pub struct Database {
    db: mongodb::Database,
}

impl Database {
    /// Connect to MongoDB with the given URI and database name.
    ///
    /// # Errors
    /// Returns error if the connection or the initial ping fails.
    pub async fn connect(uri: &str, db_name: &str) -> anyhow::Result<Self> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;

        // Ping the database to verify connection
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        info!("Successfully connected to MongoDB");

        Ok(Self {
            db: client.database(db_name),
        })
    }

    /// Get a typed collection from the database.
    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }
}

/// Stored form of one snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotDocument {
    key: String,
    payload: String,
    updated_at: i64,
}

/// Snapshot store keeping one document per key.
#[derive(Debug, Clone)]
pub struct MongoSnapshotStore {
    collection: Collection<SnapshotDocument>,
}

impl MongoSnapshotStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("guardrail_snapshots"),
        }
    }
}

impl SnapshotStore for MongoSnapshotStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        async move {
            let found = self.collection.find_one(doc! { "key": key }).await?;
            Ok(found.map(|document| document.payload))
        }
        .boxed()
    }

    fn save<'a>(&'a self, key: &'a str, blob: String) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let document = SnapshotDocument {
                key: key.to_string(),
                payload: blob,
                updated_at: chrono::Utc::now().timestamp_millis(),
            };
            let options = ReplaceOptions::builder().upsert(true).build();

            self.collection
                .replace_one(doc! { "key": key }, &document)
                .with_options(options)
                .await?;

            debug!("Saved snapshot {} to MongoDB", key);
            Ok(())
        }
        .boxed()
    }
}
