//! The Processing Engine (spec §4.E): per-session state machine driving key
//! creation, the find cursor, and cipher/AE/MAC operations. One mechanism
//! operation and one find cursor may be active at a time; nothing here
//! suspends internally (spec §5 "no internal suspension points"), so every
//! entry point does its policy checks, key load, and provider call under a
//! single lock acquisition.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::attrs::{AttributeId, Template};
use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::error::CoreError;
use crate::object::{Handle, ObjectStore};
use crate::policy::{self, Function, KeyFunction};
use crate::provider::{
    AeDecryptOperation, AeEncryptOperation, AeParams, CipherMode, CipherOperation, CipherParams, CryptoProvider, Mechanism, MacOperation,
    ProviderOp, TransientKey,
};

enum ProcessingState {
    Ready,
    Cipher { key_handle: Handle, mode: CipherMode, op: Box<dyn CipherOperation> },
    AeEncrypt { key_handle: Handle, op: Box<dyn AeEncryptOperation> },
    AeDecrypt { key_handle: Handle, op: Box<dyn AeDecryptOperation> },
    Sign { key_handle: Handle, op: Box<dyn MacOperation> },
    Verify { key_handle: Handle, op: Box<dyn MacOperation> },
}

/// One session against an [`ObjectStore`]. Login/token bring-up is an
/// external collaborator (spec §1); `read_write`/`user_logged_in` model just
/// enough of that state for the Policy Gate's rules 3/5 to apply.
pub struct Session {
    id: u64,
    store: Arc<ObjectStore>,
    provider: Arc<dyn CryptoProvider>,
    audit: Arc<dyn AuditSinkSync>,
    state: ProcessingState,
    find_cursor: Option<VecDeque<Handle>>,
    pub read_write: bool,
    pub user_logged_in: bool,
}

impl Session {
    pub fn new(id: u64, store: Arc<ObjectStore>, provider: Arc<dyn CryptoProvider>, audit: Arc<dyn AuditSinkSync>) -> Self {
        Self { id, store, provider, audit, state: ProcessingState::Ready, find_cursor: None, read_write: true, user_logged_in: true }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // -----------------------------------------------------------------
    // Object creation / destruction
    // -----------------------------------------------------------------

    pub fn import_object(&self, template: &Template, as_token: bool) -> Result<Handle, CoreError> {
        let blob = policy::create_attributes_from_template(template, Function::Import)?;
        policy::check_created_attrs_against_token(&blob, self.read_write, self.user_logged_in)?;
        let handle = self.store.create_object(self.id, blob, as_token)?;
        self.audit.record(AuditEvent::object_event(handle, AuditAction::KeyImported));
        Ok(handle)
    }

    pub fn generate_object(&self, mechanism: Mechanism, template: &Template, as_token: bool) -> Result<Handle, CoreError> {
        let value_len = template.get(AttributeId::ValueLen).ok_or(CoreError::TemplateInconsistent)?;
        let value_len = read_u32(value_len)? as usize;

        let mut blob = policy::create_attributes_from_template(template, Function::Generate)?;
        policy::check_created_attrs_against_processing(mechanism, &blob)?;
        policy::check_created_attrs_against_token(&blob, self.read_write, self.user_logged_in)?;

        let random = self.provider.random_bytes(value_len)?;
        blob.add_attribute(AttributeId::Value, &random)?;

        let handle = self.store.create_object(self.id, blob, as_token)?;
        self.audit.record(AuditEvent::object_event(handle, AuditAction::KeyGenerated));
        Ok(handle)
    }

    pub fn destroy_object(&self, handle: Handle, session_only: bool) -> Result<(), CoreError> {
        self.store.destroy_object(self.id, handle, session_only)
    }

    // -----------------------------------------------------------------
    // Find cursor (spec §4.C, P4: at most one active cursor per session)
    // -----------------------------------------------------------------

    pub fn find_init(&mut self, reference: &Template) -> Result<(), CoreError> {
        if self.find_cursor.is_some() {
            return Err(CoreError::OperationActive);
        }
        let matches = self.store.matching_handles(self.id, reference);
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::FindInitiated { match_count: matches.len() }));
        self.find_cursor = Some(matches.into());
        Ok(())
    }

    pub fn find_next(&mut self, max_count: usize) -> Result<Vec<Handle>, CoreError> {
        let cursor = self.find_cursor.as_mut().ok_or(CoreError::OperationNotInitialized)?;
        let mut out = Vec::with_capacity(max_count.min(cursor.len()));
        while out.len() < max_count {
            match cursor.pop_front() {
                Some(handle) => out.push(handle),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn find_final(&mut self) -> Result<(), CoreError> {
        if self.find_cursor.take().is_none() {
            return Err(CoreError::OperationNotInitialized);
        }
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::FindCursorExhausted));
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shared key-loading path
    // -----------------------------------------------------------------

    /// Locks the store, runs the Policy Gate's parent-side rules (4/5),
    /// lazily loads the transient key, and hands it to `f` — all under one
    /// lock acquisition, since nothing here suspends.
    fn init_with_key<T>(
        &self,
        key_handle: Handle,
        key_function: KeyFunction,
        mechanism: Mechanism,
        f: impl FnOnce(&TransientKey) -> Result<T, crate::error::ProviderError>,
    ) -> Result<T, CoreError> {
        let mut records = self.store.records().write().unwrap();
        let record = records.get_mut(&key_handle).ok_or(CoreError::KeyHandleInvalid)?;
        if !record.is_visible_to(self.id) {
            return Err(CoreError::KeyHandleInvalid);
        }
        policy::check_parent_attrs_against_processing(mechanism, key_function, record.attrs())?;
        policy::check_parent_attrs_against_token(record.attrs(), self.user_logged_in)?;
        record.ensure_loaded(self.provider.as_ref())?;
        let key = record.transient_key().ok_or(CoreError::ContractViolation("key not loaded"))?;
        Ok(f(key)?)
    }

    // -----------------------------------------------------------------
    // Cipher (ECB/CBC/CTS/CTR)
    // -----------------------------------------------------------------

    pub fn encrypt_init(&mut self, mechanism: Mechanism, key_handle: Handle, params: CipherParams) -> Result<(), CoreError> {
        self.cipher_init(mechanism, key_handle, params, CipherMode::Encrypt, KeyFunction::Encrypt)
    }

    pub fn decrypt_init(&mut self, mechanism: Mechanism, key_handle: Handle, params: CipherParams) -> Result<(), CoreError> {
        self.cipher_init(mechanism, key_handle, params, CipherMode::Decrypt, KeyFunction::Decrypt)
    }

    fn cipher_init(
        &mut self,
        mechanism: Mechanism,
        key_handle: Handle,
        params: CipherParams,
        mode: CipherMode,
        key_function: KeyFunction,
    ) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Ready) {
            return Err(CoreError::OperationActive);
        }
        let alg = match mechanism.provider_op()? {
            ProviderOp::Cipher(alg) => alg,
            _ => return Err(CoreError::MechanismInvalid),
        };
        let provider = self.provider.clone();
        let op = self.init_with_key(key_handle, key_function, mechanism, |key| provider.cipher_init(alg, mode, key, &params))?;
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::CipherInitiated));
        self.state = ProcessingState::Cipher { key_handle, mode, op };
        Ok(())
    }

    pub fn encrypt_update(&mut self, input: &[u8]) -> Result<Vec<u8>, CoreError> {
        match &mut self.state {
            ProcessingState::Cipher { mode: CipherMode::Encrypt, op, .. } => Ok(op.update(input)?),
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn decrypt_update(&mut self, input: &[u8]) -> Result<Vec<u8>, CoreError> {
        match &mut self.state {
            ProcessingState::Cipher { mode: CipherMode::Decrypt, op, .. } => Ok(op.update(input)?),
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn encrypt_final(&mut self, final_input: &[u8], out_capacity: usize) -> Result<Vec<u8>, CoreError> {
        self.cipher_final(final_input, out_capacity, CipherMode::Encrypt, AuditAction::CipherFinalized)
    }

    pub fn decrypt_final(&mut self, final_input: &[u8], out_capacity: usize) -> Result<Vec<u8>, CoreError> {
        self.cipher_final(final_input, out_capacity, CipherMode::Decrypt, AuditAction::CipherFinalized)
    }

    fn cipher_final(&mut self, final_input: &[u8], out_capacity: usize, want_mode: CipherMode, audit_action: AuditAction) -> Result<Vec<u8>, CoreError> {
        match &self.state {
            ProcessingState::Cipher { mode, op, .. } if *mode == want_mode => {
                let need = op.output_len(final_input.len());
                if need > out_capacity {
                    return Err(CoreError::ShortBuffer { need });
                }
            }
            _ => return Err(CoreError::OperationNotInitialized),
        }
        let op = match std::mem::replace(&mut self.state, ProcessingState::Ready) {
            ProcessingState::Cipher { op, .. } => op,
            _ => unreachable!(),
        };
        self.audit.record(AuditEvent::session_event(self.id, audit_action));
        Ok(op.finish(final_input)?)
    }

    // -----------------------------------------------------------------
    // Authenticated encryption (CCM/GCM)
    // -----------------------------------------------------------------

    pub fn ae_encrypt_init(&mut self, mechanism: Mechanism, key_handle: Handle, params: AeParams) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Ready) {
            return Err(CoreError::OperationActive);
        }
        let alg = match mechanism.provider_op()? {
            ProviderOp::Ae(alg) => alg,
            _ => return Err(CoreError::MechanismInvalid),
        };
        let provider = self.provider.clone();
        let op = self.init_with_key(key_handle, KeyFunction::Encrypt, mechanism, |key| provider.ae_encrypt_init(alg, key, &params))?;
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::AeInitiated));
        self.state = ProcessingState::AeEncrypt { key_handle, op };
        Ok(())
    }

    pub fn ae_decrypt_init(&mut self, mechanism: Mechanism, key_handle: Handle, params: AeParams) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Ready) {
            return Err(CoreError::OperationActive);
        }
        let alg = match mechanism.provider_op()? {
            ProviderOp::Ae(alg) => alg,
            _ => return Err(CoreError::MechanismInvalid),
        };
        let provider = self.provider.clone();
        let op = self.init_with_key(key_handle, KeyFunction::Decrypt, mechanism, |key| provider.ae_decrypt_init(alg, key, &params))?;
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::AeInitiated));
        self.state = ProcessingState::AeDecrypt { key_handle, op };
        Ok(())
    }

    pub fn ae_encrypt_update(&mut self, input: &[u8]) -> Result<(), CoreError> {
        match &mut self.state {
            ProcessingState::AeEncrypt { op, .. } => Ok(op.update(input)?),
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn ae_decrypt_update(&mut self, input: &[u8]) -> Result<(), CoreError> {
        match &mut self.state {
            ProcessingState::AeDecrypt { op, .. } => Ok(op.update(input)?),
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn ae_encrypt_final(&mut self, final_input: &[u8], out_capacity: usize) -> Result<Vec<u8>, CoreError> {
        match &self.state {
            ProcessingState::AeEncrypt { op, .. } => {
                let need = op.output_len(final_input.len());
                if need > out_capacity {
                    return Err(CoreError::ShortBuffer { need });
                }
            }
            _ => return Err(CoreError::OperationNotInitialized),
        }
        let op = match std::mem::replace(&mut self.state, ProcessingState::Ready) {
            ProcessingState::AeEncrypt { op, .. } => op,
            _ => unreachable!(),
        };
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::AeFinalized));
        Ok(op.finish(final_input)?)
    }

    pub fn ae_decrypt_final(&mut self, final_input: &[u8], out_capacity: usize) -> Result<Vec<u8>, CoreError> {
        match &self.state {
            ProcessingState::AeDecrypt { op, .. } => {
                let need = op.output_len(final_input.len());
                if need > out_capacity {
                    return Err(CoreError::ShortBuffer { need });
                }
            }
            _ => return Err(CoreError::OperationNotInitialized),
        }
        let op = match std::mem::replace(&mut self.state, ProcessingState::Ready) {
            ProcessingState::AeDecrypt { op, .. } => op,
            _ => unreachable!(),
        };
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::AeFinalized));
        Ok(op.finish(final_input)?)
    }

    // -----------------------------------------------------------------
    // MAC (sign / verify)
    // -----------------------------------------------------------------

    pub fn sign_init(&mut self, mechanism: Mechanism, key_handle: Handle) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Ready) {
            return Err(CoreError::OperationActive);
        }
        let alg = match mechanism.provider_op()? {
            ProviderOp::Mac(alg) => alg,
            _ => return Err(CoreError::MechanismInvalid),
        };
        let provider = self.provider.clone();
        let op = self.init_with_key(key_handle, KeyFunction::Sign, mechanism, |key| provider.mac_init(alg, key))?;
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::MacInitiated));
        self.state = ProcessingState::Sign { key_handle, op };
        Ok(())
    }

    pub fn verify_init(&mut self, mechanism: Mechanism, key_handle: Handle) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Ready) {
            return Err(CoreError::OperationActive);
        }
        let alg = match mechanism.provider_op()? {
            ProviderOp::Mac(alg) => alg,
            _ => return Err(CoreError::MechanismInvalid),
        };
        let provider = self.provider.clone();
        let op = self.init_with_key(key_handle, KeyFunction::Verify, mechanism, |key| provider.mac_init(alg, key))?;
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::MacInitiated));
        self.state = ProcessingState::Verify { key_handle, op };
        Ok(())
    }

    pub fn sign_update(&mut self, input: &[u8]) -> Result<(), CoreError> {
        match &mut self.state {
            ProcessingState::Sign { op, .. } => {
                op.update(input);
                Ok(())
            }
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn verify_update(&mut self, input: &[u8]) -> Result<(), CoreError> {
        match &mut self.state {
            ProcessingState::Verify { op, .. } => {
                op.update(input);
                Ok(())
            }
            _ => Err(CoreError::OperationNotInitialized),
        }
    }

    pub fn sign_final(&mut self) -> Result<Vec<u8>, CoreError> {
        if !matches!(self.state, ProcessingState::Sign { .. }) {
            return Err(CoreError::OperationNotInitialized);
        }
        let op = match std::mem::replace(&mut self.state, ProcessingState::Ready) {
            ProcessingState::Sign { op, .. } => op,
            _ => unreachable!(),
        };
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::MacFinalized));
        Ok(op.compute_final())
    }

    pub fn verify_final(&mut self, expected: &[u8]) -> Result<(), CoreError> {
        if !matches!(self.state, ProcessingState::Verify { .. }) {
            return Err(CoreError::OperationNotInitialized);
        }
        let op = match std::mem::replace(&mut self.state, ProcessingState::Ready) {
            ProcessingState::Verify { op, .. } => op,
            _ => unreachable!(),
        };
        self.audit.record(AuditEvent::session_event(self.id, AuditAction::MacFinalized));
        Ok(op.compare_final(expected)?)
    }
}

impl Drop for Session {
    /// Releases every session-owned object on close (spec §5
    /// "Cancellation"). Token objects are untouched.
    fn drop(&mut self) {
        self.store.release_session(self.id);
    }
}

fn read_u32(value: &[u8]) -> Result<u32, CoreError> {
    let arr: [u8; 4] = value.try_into().map_err(|_| CoreError::AttributeValueInvalid)?;
    Ok(u32::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::provider::FakeProvider;

    fn new_session() -> Session {
        let audit = Arc::new(InMemoryAuditSink::new());
        let store = Arc::new(ObjectStore::new(audit.clone()));
        let provider = Arc::new(FakeProvider::default());
        Session::new(1, store, provider, audit)
    }

    fn aes_template(len: u32) -> Template {
        let mut t = Template::new();
        t.push(AttributeId::KeyType, crate::attrs::KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, len.to_le_bytes().to_vec());
        t.push(AttributeId::Encrypt, vec![1]);
        t.push(AttributeId::Decrypt, vec![1]);
        t
    }

    #[test]
    fn generate_then_find_then_destroy() {
        let mut session = new_session();
        let handle = session.generate_object(Mechanism::AesKeyGen, &aes_template(16), false).unwrap();

        session.find_init(&Template::new()).unwrap();
        let found = session.find_next(10).unwrap();
        assert_eq!(found, vec![handle]);
        session.find_final().unwrap();

        session.destroy_object(handle, false).unwrap();
    }

    #[test]
    fn double_find_init_is_operation_active() {
        let mut session = new_session();
        session.find_init(&Template::new()).unwrap();
        let err = session.find_init(&Template::new()).unwrap_err();
        assert!(matches!(err, CoreError::OperationActive));
    }

    #[test]
    fn cipher_without_encrypt_usage_bit_is_rejected() {
        let mut session = new_session();
        let mut t = Template::new();
        t.push(AttributeId::KeyType, crate::attrs::KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, 16u32.to_le_bytes().to_vec());
        t.push(AttributeId::Decrypt, vec![1]);
        let handle = session.generate_object(Mechanism::AesKeyGen, &t, false).unwrap();

        let err = session.encrypt_init(Mechanism::AesEcb, handle, CipherParams { iv: None }).unwrap_err();
        assert!(matches!(err, CoreError::KeyFunctionNotPermitted));
    }

    #[test]
    fn encrypt_final_reports_short_buffer_without_losing_operation() {
        let mut session = new_session();
        let handle = session.generate_object(Mechanism::AesKeyGen, &aes_template(16), false).unwrap();
        session.encrypt_init(Mechanism::AesEcb, handle, CipherParams { iv: None }).unwrap();

        let err = session.encrypt_final(&[0u8; 16], 0).unwrap_err();
        assert!(matches!(err, CoreError::ShortBuffer { need: 16 }));

        let out = session.encrypt_final(&[0u8; 16], 16).unwrap();
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let mut session = new_session();
        let mut t = Template::new();
        t.push(AttributeId::KeyType, crate::attrs::KeyType::GenericSecret.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, 32u32.to_le_bytes().to_vec());
        t.push(AttributeId::Sign, vec![1]);
        t.push(AttributeId::Verify, vec![1]);
        let handle = session.generate_object(Mechanism::GenericSecretKeyGen, &t, false).unwrap();

        session.sign_init(Mechanism::Sha256Hmac, handle).unwrap();
        session.sign_update(b"hello ").unwrap();
        session.sign_update(b"world").unwrap();
        let mac = session.sign_final().unwrap();

        session.verify_init(Mechanism::Sha256Hmac, handle).unwrap();
        session.verify_update(b"hello ").unwrap();
        session.verify_update(b"world").unwrap();
        session.verify_final(&mac).unwrap();
    }
}
