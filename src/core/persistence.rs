/// The key-value store the engine serializes into.
///
/// The engine owns no storage of its own. Everything durable goes through a
/// [`KeyValueStore`], and every failure is swallowed at the [`Persistence`]
/// wrapper: it is logged and generation carries on in memory.

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON serialization error: {0}")]
    Serialize(#[from] ron::Error),
    #[error("RON deserialization error: {0}")]
    Deserialize(#[from] ron::error::SpannedError),
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage keys used by the engine.
pub mod keys {
    pub const TRACKER: &str = "story:tracker";
    pub const PROTAGONIST: &str = "story:protagonist";
    pub const DIRECTIVES: &str = "story:directives";
    pub const GENERATOR_STATS: &str = "story:stats";
    pub const UNIQUENESS_STATS: &str = "uniqueness:stats";
    pub const READING_STATE: &str = "admin:reading_state";
    pub const CHAPTER_PREFIX: &str = "chapter:";
    pub const POOL_PREFIX: &str = "pool:";

    pub fn chapter(number: u64) -> String {
        format!("{}{:08}", CHAPTER_PREFIX, number)
    }

    pub fn pool(name: &str) -> String {
        format!("{}{}", POOL_PREFIX, name)
    }
}

/// A durable string-to-string map.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// In-process store, mostly for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<FxHashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FxHashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory-backed store: one `<key>.ron` file per key.
///
/// Keys may only contain ASCII alphanumerics and `:`, `_`, `-`, `.`; the
/// colon is written as `@` on disk so the files stay portable.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{}.ron", key.replace(':', "@"))))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        // Write-then-rename so a crash never leaves a torn value behind.
        let tmp = path.with_extension("ron.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("ron") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.replace('@', ":"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// Typed, failure-tolerant access to a [`KeyValueStore`].
///
/// Writes and reads never return errors: a failed write is logged and
/// counted, a failed read behaves like a missing key.
#[derive(Clone)]
pub struct Persistence {
    store: SharedStore,
    failures: Arc<Mutex<u64>>,
}

impl Persistence {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            failures: Arc::new(Mutex::new(0)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Number of store operations that failed since this handle was made.
    pub fn failures(&self) -> u64 {
        self.failures.lock().map(|n| *n).unwrap_or(0)
    }

    fn note_failure(&self, op: &str, key: &str, err: &StoreError) {
        tracing::warn!(op, key, error = %err, "persistence failure, continuing in memory");
        if let Ok(mut n) = self.failures.lock() {
            *n += 1;
        }
    }

    pub fn save<T: Serialize>(&self, key: &str, value: &T) {
        let result = ron::to_string(value)
            .map_err(StoreError::from)
            .and_then(|text| self.store.set(key, &text));
        if let Err(e) = result {
            self.note_failure("set", key, &e);
        }
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let text = match self.store.get(key) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                self.note_failure("get", key, &e);
                return None;
            }
        };
        match ron::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                self.note_failure("decode", key, &StoreError::from(e));
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            self.note_failure("remove", key, &e);
        }
    }

    /// Keys beginning with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.store.list_keys() {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
            Err(e) => {
                self.note_failure("list_keys", prefix, &e);
                Vec::new()
            }
        }
    }

    /// Remove every key beginning with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) {
        for key in self.keys_with_prefix(prefix) {
            self.remove(&key);
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("failures", &self.failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    /// A store whose every operation fails.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }
        fn list_keys(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        label: String,
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.list_keys().unwrap(), vec!["a", "b"]);
        store.remove("a").unwrap();
        assert_eq!(store.list_keys().unwrap(), vec!["b"]);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("chapter:00000001", "(x: 1)").unwrap();
        store.set("pool:adjectives", "[]").unwrap();
        assert_eq!(
            store.get("chapter:00000001").unwrap().as_deref(),
            Some("(x: 1)")
        );
        assert_eq!(
            store.list_keys().unwrap(),
            vec!["chapter:00000001", "pool:adjectives"]
        );
        store.remove("pool:adjectives").unwrap();
        store.remove("pool:adjectives").unwrap();
        assert_eq!(store.get("pool:adjectives").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("../escape", "x"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(store.set("", "x").is_err());
    }

    #[test]
    fn typed_save_and_load() {
        let persistence = Persistence::in_memory();
        let value = Sample {
            count: 3,
            label: "three".to_string(),
        };
        persistence.save("sample", &value);
        assert_eq!(persistence.load::<Sample>("sample"), Some(value));
        assert_eq!(persistence.load::<Sample>("missing"), None);
        assert_eq!(persistence.failures(), 0);
    }

    #[test]
    fn failures_are_swallowed_and_counted() {
        let persistence = Persistence::new(Arc::new(BrokenStore));
        persistence.save("k", &1u32);
        assert_eq!(persistence.load::<u32>("k"), None);
        persistence.remove("k");
        assert!(persistence.keys_with_prefix("k").is_empty());
        assert_eq!(persistence.failures(), 4);
    }

    #[test]
    fn undecodable_value_reads_as_missing() {
        let persistence = Persistence::in_memory();
        persistence.store().set("bad", "not ron at all (").unwrap();
        assert_eq!(persistence.load::<Sample>("bad"), None);
        assert_eq!(persistence.failures(), 1);
    }

    #[test]
    fn prefix_operations() {
        let persistence = Persistence::in_memory();
        persistence.save(&keys::chapter(2), &2u32);
        persistence.save(&keys::chapter(1), &1u32);
        persistence.save(&keys::pool("nouns"), &0u32);
        assert_eq!(
            persistence.keys_with_prefix(keys::CHAPTER_PREFIX),
            vec!["chapter:00000001", "chapter:00000002"]
        );
        persistence.remove_prefix(keys::CHAPTER_PREFIX);
        assert!(persistence.keys_with_prefix(keys::CHAPTER_PREFIX).is_empty());
        assert_eq!(persistence.keys_with_prefix(keys::POOL_PREFIX).len(), 1);
    }
}
