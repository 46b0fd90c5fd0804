//! Key → tag extraction and the tag → key index.

use std::collections::{HashMap, HashSet};

/// Maps a cache key to the tags used for bulk invalidation and event
/// subscription. Must be deterministic.
pub trait TagExtractor: Send + Sync {
    fn tags_for(&self, key: &str) -> Vec<String>;
}

impl<F> TagExtractor for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    fn tags_for(&self, key: &str) -> Vec<String> {
        self(key)
    }
}

/// Nouns of the transaction domain recognised by [`DomainTagExtractor::default`].
pub const DEFAULT_DOMAIN_NOUNS: &[&str] = &[
    "property",
    "transaction",
    "document",
    "payment",
    "user",
    "offer",
    "contract",
    "notification",
];

/// Tags a key with every known noun it contains (case-insensitive).
#[derive(Debug, Clone)]
pub struct DomainTagExtractor {
    nouns: Vec<String>,
}

impl DomainTagExtractor {
    pub fn new<I, S>(nouns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nouns: nouns.into_iter().map(|n| n.into().to_lowercase()).collect(),
        }
    }
}

impl Default for DomainTagExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN_NOUNS.iter().copied())
    }
}

impl TagExtractor for DomainTagExtractor {
    fn tags_for(&self, key: &str) -> Vec<String> {
        let key = key.to_lowercase();
        self.nouns
            .iter()
            .filter(|noun| key.contains(noun.as_str()))
            .cloned()
            .collect()
    }
}

/// Reverse index from tag to the keys carrying it.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    /// Index `key` under each tag. Returns the tags that had no keys before.
    pub fn add(&mut self, key: &str, tags: &[String]) -> Vec<String> {
        let mut fresh = Vec::new();
        for tag in tags {
            let keys = self.by_tag.entry(tag.clone()).or_default();
            if keys.is_empty() {
                fresh.push(tag.clone());
            }
            keys.insert(key.to_string());
        }
        fresh
    }

    /// Remove `key` from each tag. Returns the tags left with no keys.
    pub fn remove(&mut self, key: &str, tags: &[String]) -> Vec<String> {
        let mut emptied = Vec::new();
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                    emptied.push(tag.clone());
                }
            }
        }
        emptied
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        self.by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// All tags with at least one key.
    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.by_tag.keys()
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
    }
}
