//! The Policy Gate (spec §4.D): sanitizes creation templates and checks
//! created/parent attribute sets against the mechanism and token state in
//! play. Five rules, five functions; no trait, plain functions returning a
//! verdict via `Result`.

use crate::attrs::{AttributeBlob, AttributeId, KeyType, ObjectClass, Template};
use crate::error::CoreError;
use crate::provider::Mechanism;

/// Which of the four creation paths produced a template (spec §4.D rule 1
/// "sanitation by function").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Import,
    Generate,
    Derive,
    Copy,
}

/// Which usage bit a processing step exercises (spec §4.D rule 4/5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFunction {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Derive,
    Wrap,
    Unwrap,
}

impl KeyFunction {
    fn usage_bit(self) -> AttributeId {
        match self {
            Self::Encrypt => AttributeId::Encrypt,
            Self::Decrypt => AttributeId::Decrypt,
            Self::Sign => AttributeId::Sign,
            Self::Verify => AttributeId::Verify,
            Self::Derive => AttributeId::Derive,
            Self::Wrap => AttributeId::Wrap,
            Self::Unwrap => AttributeId::Unwrap,
        }
    }
}

/// Rule 1: template sanitation. Rejects duplicate ids, attributes not
/// permitted for `function`, unsupported object classes, and missing
/// mandatory attributes; fills in defaults for everything the caller left
/// unset. `VALUE` for a `Generate` template is populated by the caller
/// (the Processing Engine, after it has drawn the random bytes) — this
/// function only validates that `VALUE_LEN` was supplied.
pub fn create_attributes_from_template(template: &Template, function: Function) -> Result<AttributeBlob, CoreError> {
    let mut seen = std::collections::HashSet::new();
    for entry in &template.entries {
        if !seen.insert(entry.id) {
            return Err(CoreError::TemplateInconsistent);
        }
    }

    let class = template
        .get(AttributeId::Class)
        .map(|v| to_u32(v).map(ObjectClass::from_raw))
        .transpose()?
        .unwrap_or(ObjectClass::SecretKey);
    if class != ObjectClass::SecretKey {
        // Asymmetric classes are a non-goal (spec §1); the wire format can
        // still name them, so this is a policy rejection, not a decode failure.
        return Err(CoreError::AttributeValueInvalid);
    }

    let key_type = template
        .get(AttributeId::KeyType)
        .ok_or(CoreError::TemplateInconsistent)
        .and_then(|v| to_u32(v).map(KeyType::from_raw))?;

    for entry in &template.entries {
        if !attribute_permitted(entry.id, function) {
            return Err(CoreError::AttributeTypeInvalid);
        }
    }

    let mut blob = AttributeBlob::init_head();
    blob.add_attribute(AttributeId::Class, &class.as_raw().to_le_bytes())?;
    blob.add_attribute(AttributeId::KeyType, &key_type.as_raw().to_le_bytes())?;

    match function {
        Function::Import => {
            let value = template.get(AttributeId::Value).ok_or(CoreError::TemplateInconsistent)?;
            blob.add_attribute(AttributeId::Value, value)?;
        }
        Function::Generate => {
            let value_len = template.get(AttributeId::ValueLen).ok_or(CoreError::TemplateInconsistent)?;
            if value_len.len() != 4 {
                return Err(CoreError::AttributeValueInvalid);
            }
        }
        Function::Derive | Function::Copy => return Err(CoreError::MechanismInvalid),
    }

    for entry in &template.entries {
        match entry.id {
            AttributeId::Class | AttributeId::KeyType | AttributeId::Value | AttributeId::ValueLen => {}
            id => blob.add_attribute(id, &entry.value)?,
        }
    }

    fill_defaults(&mut blob, function);
    check_mandatory_present(&blob, key_type, function)?;

    Ok(blob)
}

fn attribute_permitted(id: AttributeId, function: Function) -> bool {
    match id {
        AttributeId::Class | AttributeId::KeyType => true,
        AttributeId::Value => matches!(function, Function::Import),
        AttributeId::ValueLen => matches!(function, Function::Generate),
        AttributeId::Token
        | AttributeId::Private
        | AttributeId::Modifiable
        | AttributeId::Extractable
        | AttributeId::Sensitive
        | AttributeId::Encrypt
        | AttributeId::Decrypt
        | AttributeId::Sign
        | AttributeId::Verify
        | AttributeId::Wrap
        | AttributeId::Unwrap
        | AttributeId::Derive => true,
        // Local, AlwaysSensitive and NeverExtractable are gate-computed only
        // (spec §4.D rule 1); a caller-supplied value is rejected.
        AttributeId::Local | AttributeId::AlwaysSensitive | AttributeId::NeverExtractable => false,
        AttributeId::Unknown(_) => false,
    }
}

fn fill_defaults(blob: &mut AttributeBlob, function: Function) {
    force_bool(blob, AttributeId::Local, matches!(function, Function::Generate));
    default_bool(blob, AttributeId::Modifiable, true);
    default_bool(blob, AttributeId::Extractable, true);
    default_bool(blob, AttributeId::Sensitive, false);
    default_bool(blob, AttributeId::AlwaysSensitive, false);
    default_bool(blob, AttributeId::NeverExtractable, false);
    default_bool(blob, AttributeId::Token, false);
    default_bool(blob, AttributeId::Private, false);
    default_bool(blob, AttributeId::Encrypt, false);
    default_bool(blob, AttributeId::Decrypt, false);
    default_bool(blob, AttributeId::Sign, false);
    default_bool(blob, AttributeId::Verify, false);
    default_bool(blob, AttributeId::Wrap, false);
    default_bool(blob, AttributeId::Unwrap, false);
    default_bool(blob, AttributeId::Derive, false);
}

fn default_bool(blob: &mut AttributeBlob, id: AttributeId, default: bool) {
    if !blob.bool_set(id) {
        let _ = blob.add_attribute(id, &[default as u8]);
    }
}

fn force_bool(blob: &mut AttributeBlob, id: AttributeId, value: bool) {
    let _ = blob.add_attribute(id, &[value as u8]);
}

/// Mandatory-attribute table (SPEC_FULL §2.D): `AES`/`GENERIC_SECRET` need
/// `VALUE` on import (`VALUE_LEN` on generate, already checked above); the
/// HMAC-specific key types need `VALUE` on import the same way.
fn check_mandatory_present(blob: &AttributeBlob, key_type: KeyType, function: Function) -> Result<(), CoreError> {
    let known_key_type = matches!(key_type, KeyType::Aes | KeyType::GenericSecret) || key_type.is_specific_hmac();
    if !known_key_type {
        return Err(CoreError::KeyTypeInconsistent);
    }
    if function == Function::Import && blob.get_attribute_ptr(AttributeId::Value).is_none() {
        return Err(CoreError::TemplateInconsistent);
    }
    Ok(())
}

/// Rule 2: creation vs. mechanism (the mechanism used to produce the
/// object — key-gen or import — must be able to produce this class/type).
pub fn check_created_attrs_against_processing(mechanism: Mechanism, blob: &AttributeBlob) -> Result<(), CoreError> {
    if blob.class() != Some(ObjectClass::SecretKey) {
        return Err(CoreError::AttributeValueInvalid);
    }
    let key_type = blob.key_type().ok_or(CoreError::ContractViolation("created object missing key type"))?;
    if !mechanism.allowed_key_types().contains(&key_type) {
        return Err(CoreError::KeyTypeInconsistent);
    }
    Ok(())
}

/// Rule 3: creation vs. token state. `TOKEN` objects require a read-write
/// session; `PRIVATE` objects require a logged-in user.
pub fn check_created_attrs_against_token(blob: &AttributeBlob, read_write: bool, user_logged_in: bool) -> Result<(), CoreError> {
    if blob.bool_attr(AttributeId::Token) && !read_write {
        return Err(CoreError::SessionReadOnly);
    }
    if blob.bool_attr(AttributeId::Private) && !user_logged_in {
        return Err(CoreError::UserNotLoggedIn);
    }
    Ok(())
}

/// Rule 4: parent key vs. mechanism/function. The key used for a processing
/// step must both carry the usage bit for the requested function and be a
/// key type the mechanism accepts.
pub fn check_parent_attrs_against_processing(mechanism: Mechanism, function: KeyFunction, parent: &AttributeBlob) -> Result<(), CoreError> {
    if !parent.bool_attr(function.usage_bit()) {
        return Err(CoreError::KeyFunctionNotPermitted);
    }
    let key_type = parent.key_type().ok_or(CoreError::ContractViolation("parent object missing key type"))?;
    if !mechanism.allowed_key_types().contains(&key_type) {
        return Err(CoreError::KeyTypeInconsistent);
    }
    Ok(())
}

/// Rule 5: parent key vs. token state — a `PRIVATE` parent requires a
/// logged-in user.
pub fn check_parent_attrs_against_token(parent: &AttributeBlob, user_logged_in: bool) -> Result<(), CoreError> {
    if parent.bool_attr(AttributeId::Private) && !user_logged_in {
        return Err(CoreError::UserNotLoggedIn);
    }
    Ok(())
}

fn to_u32(value: &[u8]) -> Result<u32, CoreError> {
    let arr: [u8; 4] = value.try_into().map_err(|_| CoreError::AttributeValueInvalid)?;
    Ok(u32::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes_import_template(value: &[u8]) -> Template {
        let mut t = Template::new();
        t.push(AttributeId::Class, ObjectClass::SecretKey.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::Value, value.to_vec());
        t.push(AttributeId::Encrypt, vec![1]);
        t
    }

    #[test]
    fn import_template_produces_sane_blob() {
        let t = aes_import_template(&[0x11; 16]);
        let blob = create_attributes_from_template(&t, Function::Import).unwrap();
        assert_eq!(blob.key_type(), Some(KeyType::Aes));
        assert!(blob.bool_attr(AttributeId::Encrypt));
        assert!(!blob.bool_attr(AttributeId::Local));
        assert!(blob.bool_attr(AttributeId::Extractable));
        assert_eq!(blob.get_attribute_ptr(AttributeId::Value), Some(&[0x11u8; 16][..]));
    }

    #[test]
    fn generate_template_forces_local_true() {
        let mut t = Template::new();
        t.push(AttributeId::Class, ObjectClass::SecretKey.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::ValueLen, 16u32.to_le_bytes().to_vec());
        let blob = create_attributes_from_template(&t, Function::Generate).unwrap();
        assert!(blob.bool_attr(AttributeId::Local));
    }

    #[test]
    fn import_without_value_is_rejected() {
        let mut t = Template::new();
        t.push(AttributeId::Class, ObjectClass::SecretKey.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        let err = create_attributes_from_template(&t, Function::Import).unwrap_err();
        assert!(matches!(err, CoreError::TemplateInconsistent));
    }

    #[test]
    fn duplicate_attribute_ids_rejected() {
        let mut t = aes_import_template(&[0x22; 16]);
        t.push(AttributeId::Encrypt, vec![0]);
        let err = create_attributes_from_template(&t, Function::Import).unwrap_err();
        assert!(matches!(err, CoreError::TemplateInconsistent));
    }

    #[test]
    fn caller_supplied_local_is_rejected() {
        let mut t = aes_import_template(&[0x33; 16]);
        t.push(AttributeId::Local, vec![1]);
        let err = create_attributes_from_template(&t, Function::Import).unwrap_err();
        assert!(matches!(err, CoreError::AttributeTypeInvalid));
    }

    #[test]
    fn created_attrs_against_processing_rejects_wrong_key_type() {
        let t = aes_import_template(&[0x44; 16]);
        let blob = create_attributes_from_template(&t, Function::Import).unwrap();
        let err = check_created_attrs_against_processing(Mechanism::GenericSecretKeyGen, &blob).unwrap_err();
        assert!(matches!(err, CoreError::KeyTypeInconsistent));
    }

    #[test]
    fn created_attrs_against_token_rejects_readonly_session() {
        let mut t = aes_import_template(&[0x55; 16]);
        t.push(AttributeId::Token, vec![1]);
        let blob = create_attributes_from_template(&t, Function::Import).unwrap();
        let err = check_created_attrs_against_token(&blob, false, true).unwrap_err();
        assert!(matches!(err, CoreError::SessionReadOnly));
    }

    #[test]
    fn parent_attrs_against_processing_rejects_missing_usage_bit() {
        let mut t = Template::new();
        t.push(AttributeId::Class, ObjectClass::SecretKey.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        t.push(AttributeId::Value, vec![0x66; 16]);
        // No ENCRYPT bit set.
        let blob = create_attributes_from_template(&t, Function::Import).unwrap();
        let err = check_parent_attrs_against_processing(Mechanism::AesEcb, KeyFunction::Encrypt, &blob).unwrap_err();
        assert!(matches!(err, CoreError::KeyFunctionNotPermitted));
    }

    #[test]
    fn parent_attrs_against_token_rejects_logged_out_private_key() {
        let mut t = aes_import_template(&[0x77; 16]);
        t.push(AttributeId::Private, vec![1]);
        let blob = create_attributes_from_template(&t, Function::Import).unwrap();
        let err = check_parent_attrs_against_token(&blob, false).unwrap_err();
        assert!(matches!(err, CoreError::UserNotLoggedIn));
    }
}
