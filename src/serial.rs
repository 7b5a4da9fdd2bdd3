//! The Serial Argument Reader (spec §4.B): a cursor over a caller-supplied
//! byte range that decodes the control-buffer layout (spec §6) — scalars,
//! one-shot mechanism parameters, and creation templates. Every read is
//! length-checked; running past the end of the buffer is `BAD_PARAM`, never
//! a panic.

use crate::attrs::{AttributeId, Template};
use crate::error::CoreError;

pub struct ArgReader<'a> {
    remaining: &'a [u8],
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { remaining: buf }
    }

    pub fn read_u32(&mut self) -> Result<u32, CoreError> {
        if self.remaining.len() < 4 {
            return Err(CoreError::BadParam);
        }
        let (head, tail) = self.remaining.split_at(4);
        self.remaining = tail;
        Ok(u32::from_le_bytes(head.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CoreError> {
        if self.remaining.len() < len {
            return Err(CoreError::BadParam);
        }
        let (head, tail) = self.remaining.split_at(len);
        self.remaining = tail;
        Ok(head)
    }

    /// One `{id, size, data}` mechanism parameter (spec §4.B "allocate-and-
    /// read-one-attribute").
    pub fn read_one_attribute(&mut self) -> Result<(AttributeId, Vec<u8>), CoreError> {
        let id = AttributeId::from_raw(self.read_u32()?);
        let size = self.read_u32()? as usize;
        let data = self.read_bytes(size)?.to_vec();
        Ok((id, data))
    }

    /// `attrs_size, attr_count`, then `attr_count` attribute triples (spec
    /// §4.B "allocate-and-read-attribute-blob"). `attrs_size` is the wire
    /// byte count of the attribute section and is not otherwise used here —
    /// the per-attribute `size` fields are authoritative.
    pub fn read_template(&mut self) -> Result<Template, CoreError> {
        let _attrs_size = self.read_u32()?;
        let attr_count = self.read_u32()? as usize;
        let mut template = Template::new();
        for _ in 0..attr_count {
            let (id, value) = self.read_one_attribute()?;
            template.push(id, value);
        }
        Ok(template)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn remaining_len(&self) -> usize {
        self.remaining.len()
    }
}

/// 4-byte alignment check for caller-supplied output buffers (SPEC_FULL
/// §2.B: this belongs to the session entry points that accept `&mut [u8]`
/// out-parameters, not to the reader itself, since the reader only ever
/// sees the *input* control buffer).
pub fn check_out_buffer_alignment(out: &[u8]) -> Result<(), CoreError> {
    if (out.as_ptr() as usize) % 4 != 0 {
        return Err(CoreError::BadParam);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::ObjectClass;

    #[test]
    fn read_u32_little_endian() {
        let buf = [0x01, 0x00, 0x00, 0x00];
        let mut r = ArgReader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert!(r.is_empty());
    }

    #[test]
    fn read_u32_underrun_is_bad_param() {
        let buf = [0x01, 0x02];
        let mut r = ArgReader::new(&buf);
        assert!(matches!(r.read_u32().unwrap_err(), CoreError::BadParam));
    }

    #[test]
    fn read_bytes_underrun_is_bad_param() {
        let buf = [0x01, 0x02, 0x03];
        let mut r = ArgReader::new(&buf);
        assert!(matches!(r.read_bytes(10).unwrap_err(), CoreError::BadParam));
    }

    #[test]
    fn read_one_attribute_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&AttributeId::Value.as_raw().to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let mut r = ArgReader::new(&buf);
        let (id, data) = r.read_one_attribute().unwrap();
        assert_eq!(id, AttributeId::Value);
        assert_eq!(data, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn read_template_with_two_entries() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes()); // attrs_size, unused
        buf.extend_from_slice(&2u32.to_le_bytes()); // attr_count

        buf.extend_from_slice(&AttributeId::Class.as_raw().to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&ObjectClass::SecretKey.as_raw().to_le_bytes());

        buf.extend_from_slice(&AttributeId::Encrypt.as_raw().to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(1);

        let mut r = ArgReader::new(&buf);
        let template = r.read_template().unwrap();
        assert_eq!(template.entries.len(), 2);
        assert_eq!(template.get(AttributeId::Class), Some(&ObjectClass::SecretKey.as_raw().to_le_bytes()[..]));
        assert_eq!(template.get(AttributeId::Encrypt), Some(&[1u8][..]));
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_template_is_bad_param() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // claims one entry, but none follow
        let mut r = ArgReader::new(&buf);
        assert!(matches!(r.read_template().unwrap_err(), CoreError::BadParam));
    }
}
