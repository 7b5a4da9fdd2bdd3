//! The Object Store (spec §4.C): owns live key objects, maps opaque 32-bit
//! handles to object records, and tracks session-vs-token ownership. Token
//! objects persist through a [`StorageBackend`]; session objects live only
//! as long as the session that created them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::attrs::{AttributeBlob, AttributeId, Template};
use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::error::CoreError;
use crate::provider::{CryptoProvider, TransientKey};

pub type Handle = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Owner {
    Session(u64),
    Token,
}

/// One live key object (spec §3 "Object Record").
pub struct ObjectRecord {
    attrs: AttributeBlob,
    transient_key: Option<TransientKey>,
    token_uuid: Option<Uuid>,
    owner: Owner,
}

impl ObjectRecord {
    pub fn attrs(&self) -> &AttributeBlob {
        &self.attrs
    }

    pub fn is_visible_to(&self, session_id: u64) -> bool {
        matches!(self.owner, Owner::Token) || self.owner == Owner::Session(session_id)
    }

    pub fn is_token(&self) -> bool {
        matches!(self.owner, Owner::Token)
    }

    /// Lazily populate the provider transient key from the object's `VALUE`
    /// attribute, exactly once (spec §3 "an optional provider-side
    /// transient-key handle, lazily populated at first use").
    pub fn ensure_loaded(&mut self, provider: &dyn CryptoProvider) -> Result<(), CoreError> {
        if self.transient_key.is_some() {
            return Ok(());
        }
        let key_type = self.attrs.key_type().ok_or(CoreError::ContractViolation("object missing key type"))?;
        let value = self
            .attrs
            .get_attribute_ptr(AttributeId::Value)
            .ok_or(CoreError::ContractViolation("object missing VALUE"))?
            .to_vec();
        let mut tk = provider.allocate_transient_key(key_type)?;
        provider.populate_transient_key(&mut tk, &value)?;
        self.transient_key = Some(tk);
        Ok(())
    }

    pub fn transient_key(&self) -> Option<&TransientKey> {
        self.transient_key.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Token persistence
// ---------------------------------------------------------------------------

/// Persists token objects as `{uuid, attribute-blob wire bytes}` (spec §6
/// "Persisted state").
pub trait StorageBackend: Send + Sync {
    fn get(&self, uuid: &Uuid) -> Result<Option<Vec<u8>>, CoreError>;
    fn put(&self, uuid: &Uuid, wire: &[u8]) -> Result<(), CoreError>;
    fn delete(&self, uuid: &Uuid) -> Result<(), CoreError>;
    fn list(&self) -> Result<Vec<(Uuid, Vec<u8>)>, CoreError>;
}

/// In-memory token store (testing and ephemeral use), grounded on the
/// teacher's `InMemoryBackend`.
#[derive(Default)]
pub struct InMemoryBackend {
    blobs: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, uuid: &Uuid) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.blobs.read().unwrap().get(uuid).cloned())
    }

    fn put(&self, uuid: &Uuid, wire: &[u8]) -> Result<(), CoreError> {
        self.blobs.write().unwrap().insert(*uuid, wire.to_vec());
        Ok(())
    }

    fn delete(&self, uuid: &Uuid) -> Result<(), CoreError> {
        self.blobs.write().unwrap().remove(uuid);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(Uuid, Vec<u8>)>, CoreError> {
        Ok(self.blobs.read().unwrap().iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

/// One file per UUID, atomic write-then-rename, grounded on the teacher's
/// `FileBackend`.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|_| CoreError::GeneralError)?;
        Ok(Self { dir })
    }

    fn path_for(&self, uuid: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.bin", uuid))
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, uuid: &Uuid) -> Result<Option<Vec<u8>>, CoreError> {
        let path = self.path_for(uuid);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path).map(Some).map_err(|_| CoreError::GeneralError)
    }

    fn put(&self, uuid: &Uuid, wire: &[u8]) -> Result<(), CoreError> {
        let path = self.path_for(uuid);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, wire).map_err(|_| CoreError::GeneralError)?;
        std::fs::rename(&tmp, &path).map_err(|_| CoreError::GeneralError)?;
        Ok(())
    }

    fn delete(&self, uuid: &Uuid) -> Result<(), CoreError> {
        let path = self.path_for(uuid);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|_| CoreError::GeneralError)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(Uuid, Vec<u8>)>, CoreError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|_| CoreError::GeneralError)?;
        for entry in entries {
            let entry = entry.map_err(|_| CoreError::GeneralError)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if let Ok(uuid) = Uuid::parse_str(stem) {
                let wire = std::fs::read(&path).map_err(|_| CoreError::GeneralError)?;
                out.push((uuid, wire));
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Object Store
// ---------------------------------------------------------------------------

pub struct ObjectStore {
    next_handle: AtomicU32,
    records: RwLock<HashMap<Handle, ObjectRecord>>,
    backend: Option<Arc<dyn StorageBackend>>,
    audit: Arc<dyn AuditSinkSync>,
}

impl ObjectStore {
    pub fn new(audit: Arc<dyn AuditSinkSync>) -> Self {
        Self { next_handle: AtomicU32::new(1), records: RwLock::new(HashMap::new()), backend: None, audit }
    }

    /// Builds a store and loads every persisted token object from `backend`
    /// up front (spec §6 "Persisted state" is read back in whole on
    /// start-up; there is no lazy/partial load path).
    pub fn with_backend(audit: Arc<dyn AuditSinkSync>, backend: Arc<dyn StorageBackend>) -> Result<Self, CoreError> {
        let store = Self { next_handle: AtomicU32::new(1), records: RwLock::new(HashMap::new()), backend: Some(backend.clone()), audit };
        for (uuid, wire) in backend.list()? {
            let blob = AttributeBlob::from_wire_bytes(&wire)?;
            let handle = store.next_handle.fetch_add(1, Ordering::Relaxed);
            store
                .records
                .write()
                .unwrap()
                .insert(handle, ObjectRecord { attrs: blob, transient_key: None, token_uuid: Some(uuid), owner: Owner::Token });
        }
        Ok(store)
    }

    /// `create_object`: assigns a handle, persists to the token backend if
    /// `as_token` is set, otherwise scopes the record to `session_id`.
    pub fn create_object(&self, session_id: u64, blob: AttributeBlob, as_token: bool) -> Result<Handle, CoreError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (owner, token_uuid) = if as_token {
            let uuid = Uuid::new_v4();
            if let Some(backend) = &self.backend {
                backend.put(&uuid, &blob.to_wire_bytes())?;
            }
            (Owner::Token, Some(uuid))
        } else {
            (Owner::Session(session_id), None)
        };
        self.records.write().unwrap().insert(handle, ObjectRecord { attrs: blob, transient_key: None, token_uuid, owner });
        self.audit.record(AuditEvent::object_event(handle, AuditAction::ObjectCreated));
        Ok(handle)
    }

    /// `destroy_object`: `session_only` refuses to destroy a token object
    /// (spec §4.C "destroy refuses ACTION_PROHIBITED if ... session-only").
    pub fn destroy_object(&self, session_id: u64, handle: Handle, session_only: bool) -> Result<(), CoreError> {
        let mut records = self.records.write().unwrap();
        let owner = records.get(&handle).ok_or(CoreError::HandleInvalid)?.owner;
        match owner {
            Owner::Session(owner_id) if owner_id == session_id => {}
            Owner::Token if !session_only => {}
            Owner::Token => return Err(CoreError::ActionProhibited),
            Owner::Session(_) => return Err(CoreError::HandleInvalid),
        }
        let removed = records.remove(&handle).unwrap();
        drop(records);
        if let Some(uuid) = removed.token_uuid {
            if let Some(backend) = &self.backend {
                backend.delete(&uuid)?;
            }
        }
        self.audit.record(AuditEvent::object_event(handle, AuditAction::ObjectDestroyed));
        Ok(())
    }

    /// Direct read access to a visible record, for everything that doesn't
    /// need to mutate it (attribute queries, the find cursor's matcher).
    pub fn with_record<T>(&self, handle: Handle, session_id: u64, f: impl FnOnce(&ObjectRecord) -> T) -> Result<T, CoreError> {
        let records = self.records.read().unwrap();
        let record = records.get(&handle).ok_or(CoreError::HandleInvalid)?;
        if !record.is_visible_to(session_id) {
            return Err(CoreError::HandleInvalid);
        }
        Ok(f(record))
    }

    /// Exclusive access to the record map for the Processing Engine, which
    /// needs to hold the lock across a policy check, lazy key load, and
    /// provider init in one atomic step.
    pub(crate) fn records(&self) -> &RwLock<HashMap<Handle, ObjectRecord>> {
        &self.records
    }

    /// Snapshot of visible handles matching `reference` (spec §4.C "find
    /// cursor... Init snapshots the set of matching handles").
    pub fn matching_handles(&self, session_id: u64, reference: &Template) -> Vec<Handle> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.is_visible_to(session_id))
            .filter(|(_, r)| crate::attrs::match_reference(reference, &r.attrs))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Drops every session-owned record when a session closes (spec §5
    /// "Cancellation"). Token objects are untouched.
    pub fn release_session(&self, session_id: u64) {
        self.records.write().unwrap().retain(|_, r| r.owner != Owner::Session(session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{KeyType, ObjectClass};
    use crate::audit::InMemoryAuditSink;

    fn test_blob() -> AttributeBlob {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Class, &ObjectClass::SecretKey.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::KeyType, &KeyType::Aes.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::Value, &[0x11; 16]).unwrap();
        blob
    }

    #[test]
    fn create_and_destroy_session_object() {
        let store = ObjectStore::new(Arc::new(InMemoryAuditSink::new()));
        let handle = store.create_object(1, test_blob(), false).unwrap();
        assert!(store.with_record(handle, 1, |_| ()).is_ok());
        store.destroy_object(1, handle, false).unwrap();
        assert!(matches!(store.with_record(handle, 1, |_| ()).unwrap_err(), CoreError::HandleInvalid));
    }

    #[test]
    fn session_object_invisible_to_other_session() {
        let store = ObjectStore::new(Arc::new(InMemoryAuditSink::new()));
        let handle = store.create_object(1, test_blob(), false).unwrap();
        assert!(matches!(store.with_record(handle, 2, |_| ()).unwrap_err(), CoreError::HandleInvalid));
    }

    #[test]
    fn token_object_visible_to_every_session_and_session_only_destroy_is_refused() {
        let store = ObjectStore::new(Arc::new(InMemoryAuditSink::new()));
        let handle = store.create_object(1, test_blob(), true).unwrap();
        assert!(store.with_record(handle, 2, |_| ()).is_ok());
        let err = store.destroy_object(2, handle, true).unwrap_err();
        assert!(matches!(err, CoreError::ActionProhibited));
        store.destroy_object(2, handle, false).unwrap();
    }

    #[test]
    fn release_session_drops_only_that_sessions_objects() {
        let store = ObjectStore::new(Arc::new(InMemoryAuditSink::new()));
        let h1 = store.create_object(1, test_blob(), false).unwrap();
        let h2 = store.create_object(2, test_blob(), false).unwrap();
        store.release_session(1);
        assert!(store.with_record(h1, 1, |_| ()).is_err());
        assert!(store.with_record(h2, 2, |_| ()).is_ok());
    }

    #[test]
    fn token_backend_persists_across_store_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()).unwrap());
        let store = ObjectStore::with_backend(Arc::new(InMemoryAuditSink::new()), backend.clone()).unwrap();
        let handle = store.create_object(1, test_blob(), true).unwrap();
        let _ = handle;

        let reopened = ObjectStore::with_backend(Arc::new(InMemoryAuditSink::new()), backend).unwrap();
        let matches = reopened.matching_handles(1, &Template::new());
        assert_eq!(matches.len(), 1);
    }
}
