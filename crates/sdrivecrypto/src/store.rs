//! Owner-scoped persistence of private key material.
//!
//! Only `p` and `q` are stored; the rest of the key pair is re-derived and
//! re-validated on load.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info};

use crate::{Decryptor, Error, Result, SecretKeyMaterial};

/// Storage for one secret per owner id.
pub trait KeyStore: Send + Sync {
    fn get(&self, owner: &str) -> Result<Option<SecretKeyMaterial>>;
    fn put(&self, owner: &str, secret: &SecretKeyMaterial) -> Result<()>;
    /// Returns whether an entry existed.
    fn delete(&self, owner: &str) -> Result<bool>;
}

/// Owner ids become file names, so anything that could escape the store
/// directory is refused.
pub fn validate_owner_id(owner: &str) -> Result<()> {
    if owner.is_empty() || owner.contains('/') || owner.contains('\\') || owner.contains("..") {
        return Err(Error::InvalidOwnerId(owner.to_string()));
    }
    Ok(())
}

/// Rebuild the owner's decryptor from stored material.
pub fn load_decryptor(store: &dyn KeyStore, owner: &str) -> Result<Decryptor> {
    let secret = store
        .get(owner)?
        .ok_or_else(|| Error::MissingKeyMaterial(owner.to_string()))?;
    Decryptor::from_secret(&secret)
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<String, SecretKeyMaterial>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Store("key store lock poisoned".into())
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, owner: &str) -> Result<Option<SecretKeyMaterial>> {
        validate_owner_id(owner)?;
        Ok(self.entries.read().map_err(poisoned)?.get(owner).cloned())
    }

    fn put(&self, owner: &str, secret: &SecretKeyMaterial) -> Result<()> {
        validate_owner_id(owner)?;
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(owner.to_string(), secret.clone());
        Ok(())
    }

    fn delete(&self, owner: &str) -> Result<bool> {
        validate_owner_id(owner)?;
        Ok(self.entries.write().map_err(poisoned)?.remove(owner).is_some())
    }
}

/// One `<owner>.json` file per owner under `root`.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so a crash never leaves a half-written key behind.
#[derive(Clone, Debug)]
pub struct JsonFileKeyStore {
    root: PathBuf,
}

impl JsonFileKeyStore {
    /// Opens the store, creating `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "opened key store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, owner: &str) -> Result<PathBuf> {
        validate_owner_id(owner)?;
        Ok(self.root.join(format!("{owner}.json")))
    }
}

impl KeyStore for JsonFileKeyStore {
    fn get(&self, owner: &str) -> Result<Option<SecretKeyMaterial>> {
        let path = self.path_for(owner)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn put(&self, owner: &str, secret: &SecretKeyMaterial) -> Result<()> {
        let path = self.path_for(owner)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(serde_json::to_string_pretty(secret)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::from(e.error))?;
        debug!(owner, path = %path.display(), "stored key material");
        Ok(())
    }

    fn delete(&self, owner: &str) -> Result<bool> {
        let path = self.path_for(owner)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;
    use rug::Integer;

    fn textbook_secret() -> SecretKeyMaterial {
        KeyPair::from_primes(Integer::from(61), Integer::from(53))
            .unwrap()
            .secret()
    }

    fn exercise(store: &dyn KeyStore) {
        assert_eq!(store.get("owner-1").unwrap(), None);
        assert_eq!(
            load_decryptor(store, "owner-1").unwrap_err(),
            Error::MissingKeyMaterial("owner-1".into())
        );

        store.put("owner-1", &textbook_secret()).unwrap();
        assert_eq!(store.get("owner-1").unwrap(), Some(textbook_secret()));
        assert_eq!(store.get("owner-2").unwrap(), None);
        assert_eq!(*load_decryptor(store, "owner-1").unwrap().key_pair().n(), 3233);

        assert!(store.delete("owner-1").unwrap());
        assert!(!store.delete("owner-1").unwrap());
        assert_eq!(store.get("owner-1").unwrap(), None);
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryKeyStore::new());
    }

    #[test]
    fn json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileKeyStore::open(dir.path().join("keys")).unwrap();
        exercise(&store);
    }

    #[test]
    fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        JsonFileKeyStore::open(dir.path())
            .unwrap()
            .put("owner-1", &textbook_secret())
            .unwrap();
        let reopened = JsonFileKeyStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("owner-1").unwrap(), Some(textbook_secret()));
        let on_disk = std::fs::read_to_string(dir.path().join("owner-1.json")).unwrap();
        assert!(on_disk.contains("\"61\""));
    }

    #[test]
    fn overwrite_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileKeyStore::open(dir.path()).unwrap();
        store.put("o", &textbook_secret()).unwrap();
        let other = KeyPair::from_primes(Integer::from(1009), Integer::from(1013))
            .unwrap()
            .secret();
        store.put("o", &other).unwrap();
        assert_eq!(store.get("o").unwrap(), Some(other));
    }

    #[test]
    fn rejects_escaping_owner_ids() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = JsonFileKeyStore::open(dir.path()).unwrap();
        let mem_store = MemoryKeyStore::new();
        for bad in ["", "../x", "a/b", "a\\b", ".."] {
            for store in [&file_store as &dyn KeyStore, &mem_store] {
                assert_eq!(
                    store.put(bad, &textbook_secret()),
                    Err(Error::InvalidOwnerId(bad.into()))
                );
            }
        }
    }

    #[test]
    fn corrupt_file_surfaces_as_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileKeyStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        assert!(matches!(store.get("bad"), Err(Error::Store(_))));
    }

    #[test]
    fn stored_material_is_revalidated() {
        let store = MemoryKeyStore::new();
        let forged = SecretKeyMaterial {
            p: Integer::from(61),
            q: Integer::from(61),
        };
        store.put("x", &forged).unwrap();
        assert!(matches!(
            load_decryptor(&store, "x"),
            Err(Error::InvalidKeyMaterial(_))
        ));
    }
}
