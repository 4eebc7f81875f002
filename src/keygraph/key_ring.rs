//! Ordered, append-only key generations with an id index.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SdkError};

/// A key generation stored in a [`KeyRing`].
pub trait VersionedKey {
    /// Id of the generation.
    fn key_id(&self) -> &str;

    /// Creation time (ms).
    fn created_at(&self) -> u64;
}

/// Key generations of one group or user.
///
/// Keys keep the order they were learned in: the first page from the server
/// (newest first), then older pages, then keys fetched on demand. Positions
/// never change once assigned, and the id index always covers exactly the
/// stored keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRing<K> {
    keys: Vec<K>,
    key_map: HashMap<String, usize>,
    newest_key_id: Option<String>,
}

impl<K> Default for KeyRing<K> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            key_map: HashMap::new(),
            newest_key_id: None,
        }
    }
}

impl<K: VersionedKey> KeyRing<K> {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ring from keys in server order; the first key is the newest.
    #[must_use]
    pub fn from_server_order(keys: Vec<K>) -> Self {
        let mut ring = Self::new();
        let newest = keys.first().map(|k| k.key_id().to_string());
        for key in keys {
            ring.push(key);
        }
        if let Some(id) = newest {
            ring.mark_newest(&id);
        }
        ring
    }

    /// Appends a key and returns its position.
    ///
    /// A key whose id is already stored is not replaced; the existing
    /// position is returned.
    pub fn push(&mut self, key: K) -> usize {
        if let Some(index) = self.key_map.get(key.key_id()) {
            return *index;
        }
        let index = self.keys.len();
        self.key_map.insert(key.key_id().to_string(), index);
        self.keys.push(key);
        index
    }

    /// Returns the key with the given id.
    #[must_use]
    pub fn get(&self, key_id: &str) -> Option<&K> {
        self.key_map.get(key_id).and_then(|i| self.keys.get(*i))
    }

    /// Returns the position of the key with the given id.
    #[must_use]
    pub fn index_of(&self, key_id: &str) -> Option<usize> {
        self.key_map.get(key_id).copied()
    }

    /// Returns true if the id is stored.
    #[must_use]
    pub fn contains(&self, key_id: &str) -> bool {
        self.key_map.contains_key(key_id)
    }

    /// Makes `key_id` the newest generation.
    ///
    /// Returns false (and changes nothing) if the id is unknown or the
    /// current newest generation was created later.
    pub fn mark_newest(&mut self, key_id: &str) -> bool {
        let Some(candidate) = self.get(key_id) else {
            return false;
        };
        if let Some(current) = self.newest_key_id.as_deref().and_then(|id| self.get(id)) {
            if current.created_at() > candidate.created_at() {
                return false;
            }
        }
        self.newest_key_id = Some(key_id.to_string());
        true
    }

    /// Returns the newest generation.
    ///
    /// # Errors
    ///
    /// - `SdkError::KeyNotFound` if the ring is empty
    /// - `SdkError::InvalidState` if keys are stored but the newest id is
    ///   unset or not stored
    pub fn newest(&self) -> Result<&K> {
        match self.newest_key_id.as_deref() {
            None if self.keys.is_empty() => {
                Err(SdkError::KeyNotFound("no key generation stored".to_string()))
            }
            None => Err(SdkError::InvalidState(format!(
                "{} key generations stored but none is marked newest",
                self.keys.len()
            ))),
            Some(id) => self.get(id).ok_or_else(|| {
                SdkError::InvalidState(format!("newest key generation {id} is not stored"))
            }),
        }
    }
}

impl<K> KeyRing<K> {
    /// Id of the newest generation.
    #[must_use]
    pub fn newest_key_id(&self) -> Option<&str> {
        self.newest_key_id.as_deref()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in stored order.
    #[must_use]
    pub fn as_slice(&self) -> &[K] {
        &self.keys
    }

    /// Iterates keys in stored order.
    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.keys.iter()
    }

    /// The last stored key.
    #[must_use]
    pub fn last(&self) -> Option<&K> {
        self.keys.last()
    }

    /// Id to position index.
    #[must_use]
    pub const fn key_map(&self) -> &HashMap<String, usize> {
        &self.key_map
    }

    /// Returns page `page` of `page_size` keys and whether more pages follow.
    #[must_use]
    pub fn page(&self, page: usize, page_size: usize) -> (&[K], bool) {
        let start = page.saturating_mul(page_size).min(self.keys.len());
        let end = start.saturating_add(page_size).min(self.keys.len());
        (&self.keys[start..end], end < self.keys.len())
    }
}

impl<K: VersionedKey> KeyRing<K> {
    /// Returns true if the id index covers exactly the stored keys.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.key_map.len() == self.keys.len()
            && self
                .key_map
                .iter()
                .all(|(id, i)| self.keys.get(*i).is_some_and(|k| k.key_id() == id))
    }
}

impl<'a, K> IntoIterator for &'a KeyRing<K> {
    type Item = &'a K;
    type IntoIter = std::slice::Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

// The index is derived on load, so a stored ring can never disagree with it.
#[derive(Serialize)]
struct KeyRingRef<'a, K> {
    keys: &'a [K],
    newest_key_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct KeyRingOwned<K> {
    keys: Vec<K>,
    #[serde(default)]
    newest_key_id: Option<String>,
}

impl<K: Serialize> Serialize for KeyRing<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        KeyRingRef {
            keys: &self.keys,
            newest_key_id: self.newest_key_id.as_deref(),
        }
        .serialize(serializer)
    }
}

impl<'de, K: Deserialize<'de> + VersionedKey> Deserialize<'de> for KeyRing<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let stored = KeyRingOwned::<K>::deserialize(deserializer)?;
        let mut ring = Self::new();
        for key in stored.keys {
            ring.push(key);
        }
        ring.newest_key_id = stored.newest_key_id;
        Ok(ring)
    }
}
