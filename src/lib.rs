//! # Secure Key Services
//!
//! An in-process, PKCS#11-flavored key object service: attribute-described
//! key objects, a policy gate that sanitizes creation templates and checks
//! every operation against the object's usage bits, and a per-session
//! processing engine for symmetric cipher, authenticated-encryption, and MAC
//! operations.
//!
//! The raw cryptographic primitives and the control-buffer wire format are
//! out of scope here (see `provider` and `serial` respectively for the
//! narrow surfaces this crate actually owns); what this crate owns is the
//! object lifecycle and the rules that govern it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use sks_core::*;
//! use std::sync::Arc;
//!
//! let audit = Arc::new(InMemoryAuditSink::new());
//! let store = Arc::new(ObjectStore::new(audit.clone()));
//! let provider = Arc::new(RustCryptoProvider::default());
//! let mut session = Session::new(1, store, provider, audit);
//!
//! let mut template = Template::new();
//! template.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
//! template.push(AttributeId::ValueLen, 16u32.to_le_bytes().to_vec());
//! template.push(AttributeId::Encrypt, vec![1]);
//! template.push(AttributeId::Decrypt, vec![1]);
//! let key = session.generate_object(Mechanism::AesKeyGen, &template, false).unwrap();
//!
//! session.encrypt_init(Mechanism::AesEcb, key, CipherParams { iv: None }).unwrap();
//! let ciphertext = session.encrypt_final(&[0u8; 16], 16).unwrap();
//! ```

pub mod attrs;
pub mod audit;
pub mod error;
pub mod object;
pub mod policy;
pub mod provider;
pub mod serial;
pub mod session;

pub use attrs::{AttributeBlob, AttributeId, KeyType, ObjectClass, Template, TemplateEntry};
pub use audit::{AuditAction, AuditEvent, AuditSinkSync, FileAuditSink, InMemoryAuditSink, IntegrityChainSink, TracingAuditSink};
pub use error::{CoreError, ProviderError};
pub use object::{FileBackend, Handle, InMemoryBackend, ObjectStore, StorageBackend};
pub use policy::{Function, KeyFunction};
pub use provider::{
    AeAlgorithm, AeParams, CipherAlgorithm, CipherMode, CipherParams, CryptoProvider, FakeProvider, MacAlgorithm, Mechanism, ProviderOp,
    RustCryptoProvider,
};
pub use serial::ArgReader;
pub use session::Session;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixture() -> Session {
        let audit = Arc::new(InMemoryAuditSink::new());
        let store = Arc::new(ObjectStore::new(audit.clone()));
        let provider = Arc::new(RustCryptoProvider);
        Session::new(1, store, provider, audit)
    }

    fn aes_template(len: u32, usage: &[AttributeId]) -> Template {
        let mut t = Template::new();
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, len.to_le_bytes().to_vec());
        for id in usage {
            t.push(*id, vec![1]);
        }
        t
    }

    // spec §8 scenario 1: generate an AES-128 key, destroy it, confirm it is
    // gone from both the session's own view and a fresh find.
    #[test]
    fn generate_and_destroy_round_trip() {
        let mut session = fixture();
        let handle = session.generate_object(Mechanism::AesKeyGen, &aes_template(16, &[AttributeId::Encrypt, AttributeId::Decrypt]), false).unwrap();

        session.find_init(&Template::new()).unwrap();
        assert_eq!(session.find_next(10).unwrap(), vec![handle]);
        session.find_final().unwrap();

        session.destroy_object(handle, false).unwrap();

        session.find_init(&Template::new()).unwrap();
        assert!(session.find_next(10).unwrap().is_empty());
        session.find_final().unwrap();
    }

    // spec §8 scenario 2: known-answer ECB encryption.
    #[test]
    fn ecb_encrypt_matches_known_answer() {
        let mut session = fixture();
        let mut t = Template::new();
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::Value, hex::decode("00112233445566778899aabbccddeeff").unwrap());
        t.push(AttributeId::Encrypt, vec![1]);
        let handle = session.import_object(&t, false).unwrap();

        session.encrypt_init(Mechanism::AesEcb, handle, CipherParams { iv: None }).unwrap();
        let ct = session.encrypt_final(&[0u8; 16], 16).unwrap();
        assert_eq!(hex::encode(ct), "66e94bd4ef8a2c3b884cfa59ca342b2e");
    }

    // spec §8 scenario 3: GCM encrypt must report SHORT_BUFFER against an
    // undersized caller buffer without losing the in-progress operation,
    // then succeed once given the exact 22-byte requirement (6-byte
    // plaintext + 16-byte tag).
    #[test]
    fn gcm_encrypt_reports_short_buffer_before_succeeding() {
        let mut session = fixture();
        let mut t = Template::new();
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, 16u32.to_le_bytes().to_vec());
        t.push(AttributeId::Encrypt, vec![1]);
        let handle = session.generate_object(Mechanism::AesKeyGen, &t, false).unwrap();

        let params = AeParams { nonce: vec![0u8; 12], tag_len: 16, aad: Vec::new() };
        session.ae_encrypt_init(Mechanism::AesGcm, handle, params).unwrap();

        let err = session.ae_encrypt_final(b"secret", 10).unwrap_err();
        assert!(matches!(err, CoreError::ShortBuffer { need: 22 }));

        let ct = session.ae_encrypt_final(b"secret", 22).unwrap();
        assert_eq!(ct.len(), 22);
    }

    // spec §4.D rule 4: a mechanism may only run against a key carrying the
    // matching usage bit.
    #[test]
    fn encrypt_rejected_without_usage_bit() {
        let mut session = fixture();
        let handle = session.generate_object(Mechanism::AesKeyGen, &aes_template(16, &[AttributeId::Decrypt]), false).unwrap();
        let err = session.encrypt_init(Mechanism::AesEcb, handle, CipherParams { iv: None }).unwrap_err();
        assert!(matches!(err, CoreError::KeyFunctionNotPermitted));
    }

    // spec §4.D rule 3: a TOKEN object cannot be created on a read-only
    // session.
    #[test]
    fn token_object_requires_read_write_session() {
        let mut session = fixture();
        session.read_write = false;
        let mut t = aes_template(16, &[AttributeId::Encrypt]);
        t.push(AttributeId::Token, vec![1]);
        let err = session.generate_object(Mechanism::AesKeyGen, &t, true).unwrap_err();
        assert!(matches!(err, CoreError::SessionReadOnly));
    }

    // spec §4.D rule 2: a mechanism may only create a key type it supports.
    #[test]
    fn generate_rejects_mismatched_key_type() {
        let mut session = fixture();
        let mut t = Template::new();
        t.push(AttributeId::KeyType, KeyType::GenericSecret.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, 16u32.to_le_bytes().to_vec());
        let err = session.generate_object(Mechanism::AesKeyGen, &t, false).unwrap_err();
        assert!(matches!(err, CoreError::KeyTypeInconsistent));
    }
}
