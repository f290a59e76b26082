use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use blueprint_sdk::stores::local_database::{Error as StoreError, LocalDatabase};

use crate::error::{Result, SandboxError};

impl From<StoreError> for SandboxError {
    fn from(err: StoreError) -> Self {
        SandboxError::Storage(err.to_string())
    }
}

/// Resolve the state directory from `DEVBOX_STATE_DIR`, defaulting to
/// `./devbox-state`.
///
/// Creates the directory with restrictive permissions (0o700) if it doesn't exist.
pub fn state_dir() -> PathBuf {
    let dir = std::env::var("DEVBOX_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("devbox-state"));
    ensure_dir(&dir);
    dir
}

fn ensure_dir(dir: &Path) {
    if !dir.exists() {
        std::fs::create_dir_all(dir).ok();
        // Restrict directory permissions: only owner can read/write/traverse.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
}

/// Convenience wrapper that bridges `LocalDatabase` to our `SandboxError` types.
pub struct PersistentStore<V> {
    db: LocalDatabase<V>,
    /// Held across check-then-write sequences.
    writes: Mutex<()>,
}

impl<V> PersistentStore<V>
where
    V: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent);
        }
        let db = LocalDatabase::open(path)?;
        Ok(Self {
            db,
            writes: Mutex::new(()),
        })
    }

    /// Store backed by a fresh file under the system temp dir.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn scratch() -> Self {
        let path = std::env::temp_dir()
            .join(format!("devbox-store-{}", std::process::id()))
            .join(format!("{}.json", uuid::Uuid::new_v4()));
        match Self::open(path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open scratch store: {err}"),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.get(key)?)
    }

    pub fn find<F>(&self, predicate: F) -> Result<Option<V>>
    where
        F: Fn(&V) -> bool,
    {
        Ok(self.db.find(predicate)?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.db.values()?)
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        let _writes = self.lock_writes();
        Ok(self.db.set(&key, value)?)
    }

    /// Insert only when `key` is vacant and no existing value satisfies `clash`.
    /// Concurrent callers cannot both pass the check.
    pub fn insert_unique<F>(&self, key: String, value: V, clash: F) -> Result<bool>
    where
        F: Fn(&V) -> bool,
    {
        let _writes = self.lock_writes();
        if self.db.get(&key)?.is_some() || self.db.find(clash)?.is_some() {
            return Ok(false);
        }
        self.db.set(&key, value)?;
        Ok(true)
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        let _writes = self.lock_writes();
        Ok(self.db.remove(key)?)
    }

    pub fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        let _writes = self.lock_writes();
        Ok(self.db.update(key, f)?)
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Item {
        name: String,
        count: u32,
    }

    fn item(name: &str, count: u32) -> Item {
        Item {
            name: name.into(),
            count,
        }
    }

    #[test]
    fn crud() {
        let store = PersistentStore::<Item>::scratch();
        store.insert("a".into(), item("a", 1)).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(item("a", 1)));

        assert!(store.update("a", |v| v.count = 5).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().count, 5);
        assert!(!store.update("missing", |v| v.count = 9).unwrap());

        assert_eq!(store.find(|v| v.count == 5).unwrap(), Some(item("a", 5)));
        assert_eq!(store.remove("a").unwrap(), Some(item("a", 5)));
        assert!(store.values().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("items.json");
        {
            let store = PersistentStore::<Item>::open(path.clone()).unwrap();
            store.insert("x".into(), item("x", 3)).unwrap();
            store.insert("y".into(), item("y", 4)).unwrap();
            store.remove("y").unwrap();
        }
        let reopened = PersistentStore::<Item>::open(path).unwrap();
        assert_eq!(reopened.values().unwrap(), vec![item("x", 3)]);
    }

    #[test]
    fn insert_unique_rejects_clash() {
        let store = PersistentStore::<Item>::scratch();
        assert!(
            store
                .insert_unique("1".into(), item("alice", 0), |v| v.name == "alice")
                .unwrap()
        );
        assert!(
            !store
                .insert_unique("2".into(), item("alice", 1), |v| v.name == "alice")
                .unwrap()
        );
        assert!(!store.insert_unique("1".into(), item("bob", 0), |_| false).unwrap());
        assert_eq!(store.values().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_insert_unique_admits_one() {
        let store = std::sync::Arc::new(PersistentStore::<Item>::scratch());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .insert_unique(format!("k{i}"), item("same", i), |v| v.name == "same")
                        .unwrap()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(store.values().unwrap().len(), 1);
    }
}
