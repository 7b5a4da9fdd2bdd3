//! Attribute blobs: the self-describing representation of a PKCS#11-style
//! key object or creation template.
//!
//! Two distinct types live here. [`Template`] is the flat, wire-shaped list
//! of `{id, size, value}` triples a caller hands in (see the Serial Argument
//! Reader); it may carry duplicates, unknown ids, or be missing mandatory
//! fields. [`AttributeBlob`] is the canonical, sanitized form an
//! [`crate::object::ObjectRecord`] actually owns: class and key-type live in
//! dedicated header fields, booleans live in a 64-bit bitfield, and
//! everything else lives in an entry list. `create_attributes_from_template`
//! in `policy.rs` is the only place a `Template` turns into an
//! `AttributeBlob`.

use std::fmt;

use zeroize::Zeroize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Attribute ids
// ---------------------------------------------------------------------------

/// PKCS#11-style attribute id. Unknown ids decode to `Unknown` rather than
/// failing — the Policy Gate is the place that rejects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeId {
    Class,
    KeyType,
    Value,
    ValueLen,
    Token,
    Private,
    Modifiable,
    Extractable,
    Sensitive,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Derive,
    Local,
    AlwaysSensitive,
    NeverExtractable,
    Unknown(u32),
}

impl AttributeId {
    const RAW_CLASS: u32 = 0x0000_0000;
    const RAW_TOKEN: u32 = 0x0000_0001;
    const RAW_PRIVATE: u32 = 0x0000_0002;
    const RAW_VALUE: u32 = 0x0000_0011;
    const RAW_VALUE_LEN: u32 = 0x0000_0161;
    const RAW_KEY_TYPE: u32 = 0x0000_0100;
    const RAW_SENSITIVE: u32 = 0x0000_0103;
    const RAW_ENCRYPT: u32 = 0x0000_0104;
    const RAW_DECRYPT: u32 = 0x0000_0105;
    const RAW_WRAP: u32 = 0x0000_0106;
    const RAW_UNWRAP: u32 = 0x0000_0107;
    const RAW_SIGN: u32 = 0x0000_0108;
    const RAW_VERIFY: u32 = 0x0000_010A;
    const RAW_DERIVE: u32 = 0x0000_010C;
    const RAW_LOCAL: u32 = 0x0000_0110;
    const RAW_MODIFIABLE: u32 = 0x0000_0170;
    const RAW_EXTRACTABLE: u32 = 0x0000_0162;
    const RAW_ALWAYS_SENSITIVE: u32 = 0x0000_0163;
    const RAW_NEVER_EXTRACTABLE: u32 = 0x0000_0164;

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::RAW_CLASS => Self::Class,
            Self::RAW_KEY_TYPE => Self::KeyType,
            Self::RAW_VALUE => Self::Value,
            Self::RAW_VALUE_LEN => Self::ValueLen,
            Self::RAW_TOKEN => Self::Token,
            Self::RAW_PRIVATE => Self::Private,
            Self::RAW_MODIFIABLE => Self::Modifiable,
            Self::RAW_EXTRACTABLE => Self::Extractable,
            Self::RAW_SENSITIVE => Self::Sensitive,
            Self::RAW_ENCRYPT => Self::Encrypt,
            Self::RAW_DECRYPT => Self::Decrypt,
            Self::RAW_SIGN => Self::Sign,
            Self::RAW_VERIFY => Self::Verify,
            Self::RAW_WRAP => Self::Wrap,
            Self::RAW_UNWRAP => Self::Unwrap,
            Self::RAW_DERIVE => Self::Derive,
            Self::RAW_LOCAL => Self::Local,
            Self::RAW_ALWAYS_SENSITIVE => Self::AlwaysSensitive,
            Self::RAW_NEVER_EXTRACTABLE => Self::NeverExtractable,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Class => Self::RAW_CLASS,
            Self::KeyType => Self::RAW_KEY_TYPE,
            Self::Value => Self::RAW_VALUE,
            Self::ValueLen => Self::RAW_VALUE_LEN,
            Self::Token => Self::RAW_TOKEN,
            Self::Private => Self::RAW_PRIVATE,
            Self::Modifiable => Self::RAW_MODIFIABLE,
            Self::Extractable => Self::RAW_EXTRACTABLE,
            Self::Sensitive => Self::RAW_SENSITIVE,
            Self::Encrypt => Self::RAW_ENCRYPT,
            Self::Decrypt => Self::RAW_DECRYPT,
            Self::Sign => Self::RAW_SIGN,
            Self::Verify => Self::RAW_VERIFY,
            Self::Wrap => Self::RAW_WRAP,
            Self::Unwrap => Self::RAW_UNWRAP,
            Self::Derive => Self::RAW_DERIVE,
            Self::Local => Self::RAW_LOCAL,
            Self::AlwaysSensitive => Self::RAW_ALWAYS_SENSITIVE,
            Self::NeverExtractable => Self::RAW_NEVER_EXTRACTABLE,
            Self::Unknown(raw) => raw,
        }
    }

    /// Bit index in the boolean bitfield, if this id is a boolean attribute.
    pub fn bool_bit(self) -> Option<u8> {
        match self {
            Self::Token => Some(0),
            Self::Private => Some(1),
            Self::Modifiable => Some(2),
            Self::Extractable => Some(3),
            Self::Sensitive => Some(4),
            Self::Encrypt => Some(5),
            Self::Decrypt => Some(6),
            Self::Sign => Some(7),
            Self::Verify => Some(8),
            Self::Wrap => Some(9),
            Self::Unwrap => Some(10),
            Self::Derive => Some(11),
            Self::Local => Some(12),
            Self::AlwaysSensitive => Some(13),
            Self::NeverExtractable => Some(14),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:08x})", raw),
            other => write!(f, "{:?}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Object class / key type
// ---------------------------------------------------------------------------

/// Object class. Only `SecretKey` is producible by this engine (asymmetric
/// classes are a non-goal) but the wire format can still name them, so
/// decoding never fails — the Policy Gate rejects what it doesn't support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    SecretKey,
    PublicKey,
    PrivateKey,
    Data,
    Unknown(u32),
}

impl ObjectClass {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Data,
            2 => Self::PublicKey,
            3 => Self::PrivateKey,
            4 => Self::SecretKey,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Data => 0,
            Self::PublicKey => 2,
            Self::PrivateKey => 3,
            Self::SecretKey => 4,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecretKey => write!(f, "SECRET_KEY"),
            Self::PublicKey => write!(f, "PUBLIC_KEY"),
            Self::PrivateKey => write!(f, "PRIVATE_KEY"),
            Self::Data => write!(f, "DATA"),
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:08x})", raw),
        }
    }
}

/// Key type. Covers the symmetric key types this engine actually produces
/// and consumes (spec §4.D mandatory-attribute table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Aes,
    GenericSecret,
    Md5Hmac,
    Sha1Hmac,
    Sha224Hmac,
    Sha256Hmac,
    Sha384Hmac,
    Sha512Hmac,
    Unknown(u32),
}

impl KeyType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x1F => Self::Aes,
            0x10 => Self::GenericSecret,
            0x20 => Self::Md5Hmac,
            0x21 => Self::Sha1Hmac,
            0x22 => Self::Sha224Hmac,
            0x23 => Self::Sha256Hmac,
            0x24 => Self::Sha384Hmac,
            0x25 => Self::Sha512Hmac,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Aes => 0x1F,
            Self::GenericSecret => 0x10,
            Self::Md5Hmac => 0x20,
            Self::Sha1Hmac => 0x21,
            Self::Sha224Hmac => 0x22,
            Self::Sha256Hmac => 0x23,
            Self::Sha384Hmac => 0x24,
            Self::Sha512Hmac => 0x25,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether this key type is one of the HMAC-specific types (as opposed
    /// to `GenericSecret`, which every HMAC mechanism also accepts).
    pub fn is_specific_hmac(self) -> bool {
        matches!(
            self,
            Self::Md5Hmac
                | Self::Sha1Hmac
                | Self::Sha224Hmac
                | Self::Sha256Hmac
                | Self::Sha384Hmac
                | Self::Sha512Hmac
        )
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes => write!(f, "AES"),
            Self::GenericSecret => write!(f, "GENERIC_SECRET"),
            Self::Md5Hmac => write!(f, "MD5_HMAC"),
            Self::Sha1Hmac => write!(f, "SHA1_HMAC"),
            Self::Sha224Hmac => write!(f, "SHA224_HMAC"),
            Self::Sha256Hmac => write!(f, "SHA256_HMAC"),
            Self::Sha384Hmac => write!(f, "SHA384_HMAC"),
            Self::Sha512Hmac => write!(f, "SHA512_HMAC"),
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:08x})", raw),
        }
    }
}

// ---------------------------------------------------------------------------
// Template: flat wire-shaped attribute list
// ---------------------------------------------------------------------------

/// One `{id, size, value}` triple as it arrives on the wire.
#[derive(Clone, Debug)]
pub struct TemplateEntry {
    pub id: AttributeId,
    pub value: Vec<u8>,
}

/// Flat, unsanitized attribute list: exactly what the Serial Argument
/// Reader decodes from a control buffer. May contain duplicates or
/// attributes not permitted for the function in play; `policy::
/// create_attributes_from_template` is what turns this into an
/// [`AttributeBlob`].
#[derive(Clone, Debug, Default)]
pub struct Template {
    pub entries: Vec<TemplateEntry>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: AttributeId, value: Vec<u8>) {
        self.entries.push(TemplateEntry { id, value });
    }

    pub fn get(&self, id: AttributeId) -> Option<&[u8]> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.value.as_slice())
    }

    pub fn count_of(&self, id: AttributeId) -> usize {
        self.entries.iter().filter(|e| e.id == id).count()
    }
}

// ---------------------------------------------------------------------------
// AttributeBlob: canonical in-memory form
// ---------------------------------------------------------------------------

/// The canonical, sanitized attribute set of a key object: class and
/// key-type in dedicated header fields, booleans in a bitfield, everything
/// else in an entry list (spec §3 Design Note "two storage variants...pick
/// one canonical form").
#[derive(Clone, Debug, Default)]
pub struct AttributeBlob {
    class: Option<ObjectClass>,
    key_type: Option<KeyType>,
    bools: u64,
    bools_set: u64,
    entries: Vec<(AttributeId, Vec<u8>)>,
}

impl Drop for AttributeBlob {
    fn drop(&mut self) {
        for (id, value) in &mut self.entries {
            if *id == AttributeId::Value {
                value.zeroize();
            }
        }
    }
}

impl AttributeBlob {
    /// `init_head`: an empty blob, header count and size zero.
    pub fn init_head() -> Self {
        Self::default()
    }

    /// Append one entry. Class, key-type, and boolean ids are routed into
    /// their header storage rather than the entry list; everything else is
    /// pushed verbatim. Matches `add_attribute`'s "never both" invariant.
    pub fn add_attribute(&mut self, id: AttributeId, value: &[u8]) -> Result<(), CoreError> {
        if id == AttributeId::Class {
            let raw = read_u32(value)?;
            self.class = Some(ObjectClass::from_raw(raw));
            return Ok(());
        }
        if id == AttributeId::KeyType {
            let raw = read_u32(value)?;
            self.key_type = Some(KeyType::from_raw(raw));
            return Ok(());
        }
        if let Some(bit) = id.bool_bit() {
            let truthy = value.first().copied().unwrap_or(0) != 0;
            if truthy {
                self.bools |= 1 << bit;
            } else {
                self.bools &= !(1 << bit);
            }
            self.bools_set |= 1 << bit;
            return Ok(());
        }
        self.entries.push((id, value.to_vec()));
        Ok(())
    }

    /// Remove exactly one occurrence. Fails `NotFound` if absent.
    pub fn remove_attribute(&mut self, id: AttributeId) -> Result<(), CoreError> {
        if id == AttributeId::Class {
            return self.class.take().map(|_| ()).ok_or(CoreError::NotFound);
        }
        if id == AttributeId::KeyType {
            return self.key_type.take().map(|_| ()).ok_or(CoreError::NotFound);
        }
        if id.bool_bit().is_some() {
            // Boolean attributes are a fixed-presence bitfield, not a
            // removable entry: there is nothing to "remove".
            return Err(CoreError::NotFound);
        }
        let pos = self.entries.iter().position(|(eid, _)| *eid == id).ok_or(CoreError::NotFound)?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Remove all occurrences of `id`, up to `max`. Resolves Open Question
    /// (b): removal always happens; if more than `max` occurrences existed,
    /// the caller's expectation was violated and `TemplateInconsistent` is
    /// returned — the removal is not rolled back.
    pub fn remove_attribute_check(&mut self, id: AttributeId, max_check: usize) -> Result<usize, CoreError> {
        let before = self.entries.len();
        self.entries.retain(|(eid, _)| *eid != id);
        let removed = before - self.entries.len();
        if removed > max_check {
            return Err(CoreError::TemplateInconsistent);
        }
        Ok(removed)
    }

    /// Every occurrence of `id`. Class and key-type are header fields, not
    /// entries — a blob built only through the canonical constructors never
    /// has more than one occurrence of anything, so this degenerates to
    /// `get_attribute_ptr` wrapped in a `Vec` for entry-list ids.
    pub fn get_attribute_ptrs(&self, id: AttributeId) -> Vec<&[u8]> {
        self.entries.iter().filter(|(eid, _)| *eid == id).map(|(_, v)| v.as_slice()).collect()
    }

    /// First occurrence, no copy. Does not resolve class/key-type (use
    /// [`Self::class`]/[`Self::key_type`]) or booleans (use
    /// [`Self::bool_attr`]) since those have no byte-slice backing.
    pub fn get_attribute_ptr(&self, id: AttributeId) -> Option<&[u8]> {
        self.entries.iter().find(|(eid, _)| *eid == id).map(|(_, v)| v.as_slice())
    }

    /// Value copy with short-buffer reporting. Boolean reads synthesize a
    /// one-byte `0x00`/`0x01` from the bitfield.
    pub fn get_attribute(&self, id: AttributeId, out: &mut [u8]) -> Result<usize, CoreError> {
        if let Some(bit) = id.bool_bit() {
            if self.bools_set & (1 << bit) == 0 {
                return Err(CoreError::NotFound);
            }
            if out.is_empty() {
                return Err(CoreError::ShortBuffer { need: 1 });
            }
            out[0] = if self.bools & (1 << bit) != 0 { 1 } else { 0 };
            return Ok(1);
        }
        if id == AttributeId::Class {
            let raw = self.class.ok_or(CoreError::NotFound)?.as_raw();
            return copy_u32(raw, out);
        }
        if id == AttributeId::KeyType {
            let raw = self.key_type.ok_or(CoreError::NotFound)?.as_raw();
            return copy_u32(raw, out);
        }
        let value = self
            .entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, v)| v.as_slice())
            .ok_or(CoreError::NotFound)?;
        if out.len() < value.len() {
            return Err(CoreError::ShortBuffer { need: value.len() });
        }
        out[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    pub fn class(&self) -> Option<ObjectClass> {
        self.class
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.key_type
    }

    /// Whether a boolean attribute is set to true (false if never set).
    pub fn bool_attr(&self, id: AttributeId) -> bool {
        match id.bool_bit() {
            Some(bit) => self.bools & (1 << bit) != 0,
            None => false,
        }
    }

    /// Whether a boolean attribute has been assigned any value at all
    /// (distinguishes "explicitly false" from "never set", which the
    /// Policy Gate needs to decide whether a default applies).
    pub fn bool_set(&self, id: AttributeId) -> bool {
        match id.bool_bit() {
            Some(bit) => self.bools_set & (1 << bit) != 0,
            None => false,
        }
    }

    /// `size(b)`: header size plus sum of entry sizes (P1). The header here
    /// is fixed-size (class + key-type tag + bitfield), so this is a
    /// bookkeeping sum over variable-length entries only.
    pub fn payload_size(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// `count(b)`: number of variable-length entries (booleans and
    /// class/key-type live in the header and are not counted).
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Wire (de)serialization for token-object persistence: a flat
    /// `{id,size,value}` list, with class/key-type/booleans re-expanded
    /// into ordinary entries so the format is self-contained.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut push_entry = |id: u32, value: &[u8]| {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        };
        if let Some(class) = self.class {
            push_entry(AttributeId::Class.as_raw(), &class.as_raw().to_le_bytes());
        }
        if let Some(kt) = self.key_type {
            push_entry(AttributeId::KeyType.as_raw(), &kt.as_raw().to_le_bytes());
        }
        for bit in 0..15u8 {
            if self.bools_set & (1 << bit) != 0 {
                if let Some(id) = bool_id_for_bit(bit) {
                    let byte = if self.bools & (1 << bit) != 0 { 1u8 } else { 0u8 };
                    push_entry(id.as_raw(), &[byte]);
                }
            }
        }
        for (id, value) in &self.entries {
            push_entry(id.as_raw(), value);
        }
        out
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut blob = Self::init_head();
        let mut cursor = bytes;
        while !cursor.is_empty() {
            if cursor.len() < 8 {
                return Err(CoreError::BadParam);
            }
            let raw_id = read_u32(&cursor[0..4])?;
            let size = read_u32(&cursor[4..8])? as usize;
            cursor = &cursor[8..];
            if cursor.len() < size {
                return Err(CoreError::BadParam);
            }
            let value = &cursor[..size];
            blob.add_attribute(AttributeId::from_raw(raw_id), value)?;
            cursor = &cursor[size..];
        }
        Ok(blob)
    }
}

fn bool_id_for_bit(bit: u8) -> Option<AttributeId> {
    const IDS: &[AttributeId] = &[
        AttributeId::Token,
        AttributeId::Private,
        AttributeId::Modifiable,
        AttributeId::Extractable,
        AttributeId::Sensitive,
        AttributeId::Encrypt,
        AttributeId::Decrypt,
        AttributeId::Sign,
        AttributeId::Verify,
        AttributeId::Wrap,
        AttributeId::Unwrap,
        AttributeId::Derive,
        AttributeId::Local,
        AttributeId::AlwaysSensitive,
        AttributeId::NeverExtractable,
    ];
    IDS.get(bit as usize).copied()
}

fn read_u32(value: &[u8]) -> Result<u32, CoreError> {
    let arr: [u8; 4] = value.try_into().map_err(|_| CoreError::AttributeValueInvalid)?;
    Ok(u32::from_le_bytes(arr))
}

fn copy_u32(raw: u32, out: &mut [u8]) -> Result<usize, CoreError> {
    if out.len() < 4 {
        return Err(CoreError::ShortBuffer { need: 4 });
    }
    out[..4].copy_from_slice(&raw.to_le_bytes());
    Ok(4)
}

/// `match_reference`: true iff every attribute named in `reference` is
/// present in `candidate` with identical bytes. `reference` is a flat
/// template (the caller's find criteria); `candidate` is a live object's
/// sanitized blob.
pub fn match_reference(reference: &Template, candidate: &AttributeBlob) -> bool {
    reference.entries.iter().all(|entry| match candidate.get_attribute_ptr(entry.id) {
        Some(actual) => actual == entry.value.as_slice(),
        None => {
            // Class/key-type aren't surfaced via get_attribute_ptr (header
            // fields); check those explicitly.
            match entry.id {
                AttributeId::Class => candidate.class().map(|c| c.as_raw().to_le_bytes().to_vec()) == Some(entry.value.clone()),
                AttributeId::KeyType => candidate.key_type().map(|k| k.as_raw().to_le_bytes().to_vec()) == Some(entry.value.clone()),
                id if id.bool_bit().is_some() => {
                    let byte = if candidate.bool_attr(id) { 1u8 } else { 0 };
                    entry.value == [byte]
                }
                _ => false,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_head_is_empty() {
        let blob = AttributeBlob::init_head();
        assert_eq!(blob.count(), 0);
        assert_eq!(blob.payload_size(), 0);
    }

    #[test]
    fn add_and_get_value_roundtrip() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Value, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        let n = blob.get_attribute(AttributeId::Value, &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn get_attribute_short_buffer_reports_need() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Value, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 2];
        let err = blob.get_attribute(AttributeId::Value, &mut out).unwrap_err();
        assert!(matches!(err, CoreError::ShortBuffer { need: 4 }));
    }

    #[test]
    fn boolean_roundtrip_is_one_byte() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Encrypt, &[1]).unwrap();
        assert!(blob.bool_attr(AttributeId::Encrypt));
        let mut out = [0xffu8; 1];
        let n = blob.get_attribute(AttributeId::Encrypt, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn remove_attribute_fails_on_absent() {
        let mut blob = AttributeBlob::init_head();
        let err = blob.remove_attribute(AttributeId::Value).unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[test]
    fn remove_attribute_check_counts_and_still_removes() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Unknown(0x9001), &[1]).unwrap();
        blob.add_attribute(AttributeId::Unknown(0x9001), &[2]).unwrap();
        blob.add_attribute(AttributeId::Unknown(0x9001), &[3]).unwrap();
        let err = blob.remove_attribute_check(AttributeId::Unknown(0x9001), 2).unwrap_err();
        assert!(matches!(err, CoreError::TemplateInconsistent));
        assert_eq!(blob.get_attribute_ptrs(AttributeId::Unknown(0x9001)).len(), 0);
    }

    #[test]
    fn class_and_key_type_live_in_header_not_entries() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Class, &ObjectClass::SecretKey.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::KeyType, &KeyType::Aes.as_raw().to_le_bytes()).unwrap();
        assert_eq!(blob.count(), 0);
        assert_eq!(blob.class(), Some(ObjectClass::SecretKey));
        assert_eq!(blob.key_type(), Some(KeyType::Aes));
    }

    #[test]
    fn match_reference_checks_every_criterion() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::KeyType, &KeyType::Aes.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::Encrypt, &[1]).unwrap();

        let mut reference = Template::new();
        reference.push(AttributeId::KeyType, KeyType::Aes.as_raw().to_le_bytes().to_vec());
        assert!(match_reference(&reference, &blob));

        let mut mismatched = Template::new();
        mismatched.push(AttributeId::KeyType, KeyType::GenericSecret.as_raw().to_le_bytes().to_vec());
        assert!(!match_reference(&mismatched, &blob));
    }

    #[test]
    fn wire_roundtrip_preserves_attributes() {
        let mut blob = AttributeBlob::init_head();
        blob.add_attribute(AttributeId::Class, &ObjectClass::SecretKey.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::KeyType, &KeyType::Aes.as_raw().to_le_bytes()).unwrap();
        blob.add_attribute(AttributeId::Encrypt, &[1]).unwrap();
        blob.add_attribute(AttributeId::Value, &[0xaa; 16]).unwrap();

        let bytes = blob.to_wire_bytes();
        let restored = AttributeBlob::from_wire_bytes(&bytes).unwrap();
        assert_eq!(restored.class(), Some(ObjectClass::SecretKey));
        assert_eq!(restored.key_type(), Some(KeyType::Aes));
        assert!(restored.bool_attr(AttributeId::Encrypt));
        assert_eq!(restored.get_attribute_ptr(AttributeId::Value), Some(&[0xaau8; 16][..]));
    }
}
