use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Cache, CacheError, Mutation};

#[derive(Debug, Clone)]
enum Entry {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

/// In-process cache with Redis hash/set semantics. Used by tests and local
/// runs without a Redis server.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Command(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

fn apply_one(entries: &mut HashMap<String, Entry>, mutation: &Mutation) -> Result<(), CacheError> {
    match mutation {
        Mutation::HashPut { key, fields } => {
            if fields.is_empty() {
                return Ok(());
            }
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::Hash(HashMap::new()));
            let Entry::Hash(hash) = entry else {
                return Err(wrong_type(key));
            };
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
        }
        Mutation::HashDelete { key, field } => match entries.get_mut(key) {
            Some(Entry::Hash(hash)) => {
                hash.remove(field);
                if hash.is_empty() {
                    entries.remove(key);
                }
            }
            Some(Entry::Set(_)) => return Err(wrong_type(key)),
            None => {}
        },
        Mutation::SetAdd { key, member } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::Set(HashSet::new()));
            let Entry::Set(set) = entry else {
                return Err(wrong_type(key));
            };
            set.insert(member.clone());
        }
        Mutation::SetRemove { key, member } => match entries.get_mut(key) {
            Some(Entry::Set(set)) => {
                set.remove(member);
                if set.is_empty() {
                    entries.remove(key);
                }
            }
            Some(Entry::Hash(_)) => return Err(wrong_type(key)),
            None => {}
        },
    }
    Ok(())
}

#[async_trait]
impl Cache for MemoryCache {
    async fn apply(&self, plan: &[Mutation]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        for mutation in plan {
            apply_one(&mut entries, mutation)?;
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        match self.entries.read().await.get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(Entry::Set(_)) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        match self.entries.read().await.get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Entry::Set(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.entries.read().await.get(key) {
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Entry::Hash(_)) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, field: &str, value: &str) -> Mutation {
        Mutation::HashPut {
            key: key.into(),
            fields: vec![(field.into(), value.into())],
        }
    }

    #[tokio::test]
    async fn hash_put_merges_fields() {
        let cache = MemoryCache::new();
        cache
            .apply(&[put("user:a", "email", "a"), put("user:a", "gender", "f")])
            .await
            .unwrap();

        let fields = cache.hash_get_all("user:a").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(
            cache.hash_get("user:a", "gender").await.unwrap().as_deref(),
            Some("f")
        );
    }

    #[tokio::test]
    async fn removing_last_member_drops_the_key() {
        let cache = MemoryCache::new();
        let add = Mutation::SetAdd {
            key: "group:users:g".into(),
            member: "a".into(),
        };
        let remove = Mutation::SetRemove {
            key: "group:users:g".into(),
            member: "a".into(),
        };

        cache.apply(&[add.clone(), add]).await.unwrap();
        assert_eq!(cache.set_members("group:users:g").await.unwrap(), vec!["a"]);

        cache.apply(&[remove]).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn type_clash_is_an_error() {
        let cache = MemoryCache::new();
        cache.apply(&[put("k", "f", "v")]).await.unwrap();

        let err = cache
            .apply(&[Mutation::SetAdd {
                key: "k".into(),
                member: "m".into(),
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
        assert!(cache.set_members("k").await.is_err());
    }

    #[tokio::test]
    async fn missing_keys_read_empty() {
        let cache = MemoryCache::new();
        assert!(cache.hash_get_all("nope").await.unwrap().is_empty());
        assert_eq!(cache.hash_get("nope", "f").await.unwrap(), None);
        assert!(cache.set_members("nope").await.unwrap().is_empty());
    }
}
