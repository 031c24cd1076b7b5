//! BER serialization primitives
//!
//! The parse direction of this crate rides on `asn1-rs`; the write direction
//! is this module. Only the subset needed by LDAPv3 is implemented: universal
//! SEQUENCE/SET/INTEGER/OCTET STRING/BOOLEAN/ENUMERATED/NULL, application
//! tags 0..=25 and context tags. Lengths are always definite and minimal, so
//! produced octets are valid DER and therefore valid BER.

use bytes::{BufMut, Bytes, BytesMut};

pub const CLASS_UNIVERSAL: u8 = 0b0000_0000;
pub const CLASS_APPLICATION: u8 = 0b0100_0000;
pub const CLASS_CONTEXT: u8 = 0b1000_0000;

const CONSTRUCTED: u8 = 0b0010_0000;

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_ENUMERATED: u8 = 0x0a;
const TAG_SEQUENCE: u8 = 0x10;
const TAG_SET: u8 = 0x11;

/// Incremental writer for BER values.
///
/// Constructed values are built depth-first: the child content is rendered
/// into a scratch writer so the definite length is known before the header
/// is emitted.
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: BytesMut,
}

impl BerWriter {
    pub fn new() -> Self {
        BerWriter::default()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn put_identifier(&mut self, identifier: u8) {
        self.buf.put_u8(identifier);
    }

    // short form below 128, long form above
    fn put_length(&mut self, len: usize) {
        if len < 0x80 {
            self.buf.put_u8(len as u8);
        } else {
            let bytes = (len as u64).to_be_bytes();
            let skip = bytes.iter().take_while(|&&b| b == 0).count();
            self.buf.put_u8(0x80 | (8 - skip) as u8);
            self.buf.put_slice(&bytes[skip..]);
        }
    }

    /// Write a primitive value with the given identifier octet
    pub fn primitive(&mut self, identifier: u8, content: &[u8]) {
        self.put_identifier(identifier);
        self.put_length(content.len());
        self.buf.put_slice(content);
    }

    /// Write a constructed value with the given class/tag, content built by `f`
    pub fn constructed(&mut self, class: u8, tag: u8, f: impl FnOnce(&mut BerWriter)) {
        let mut inner = BerWriter::new();
        f(&mut inner);
        self.put_identifier(class | CONSTRUCTED | tag);
        self.put_length(inner.buf.len());
        self.buf.put_slice(&inner.buf);
    }

    pub fn sequence(&mut self, f: impl FnOnce(&mut BerWriter)) {
        self.constructed(CLASS_UNIVERSAL, TAG_SEQUENCE, f);
    }

    pub fn set(&mut self, f: impl FnOnce(&mut BerWriter)) {
        self.constructed(CLASS_UNIVERSAL, TAG_SET, f);
    }

    pub fn octet_string(&mut self, value: &[u8]) {
        self.primitive(TAG_OCTET_STRING, value);
    }

    pub fn boolean(&mut self, value: bool) {
        self.primitive(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }]);
    }

    pub fn null(&mut self) {
        self.primitive(TAG_NULL, &[]);
    }

    pub fn integer(&mut self, value: i64) {
        let content = int_content(value);
        self.primitive(TAG_INTEGER, &content);
    }

    pub fn enumerated(&mut self, value: u32) {
        let content = int_content(value as i64);
        self.primitive(TAG_ENUMERATED, &content);
    }

    /// `[tag]` context-specific primitive (IMPLICIT)
    pub fn context_primitive(&mut self, tag: u8, content: &[u8]) {
        self.primitive(CLASS_CONTEXT | tag, content);
    }

    /// `[tag]` context-specific constructed (IMPLICIT)
    pub fn context_constructed(&mut self, tag: u8, f: impl FnOnce(&mut BerWriter)) {
        self.constructed(CLASS_CONTEXT, tag, f);
    }

    /// `[APPLICATION tag]` primitive (IMPLICIT)
    pub fn application_primitive(&mut self, tag: u8, content: &[u8]) {
        self.primitive(CLASS_APPLICATION | tag, content);
    }

    /// `[APPLICATION tag]` constructed (IMPLICIT SEQUENCE)
    pub fn application_constructed(&mut self, tag: u8, f: impl FnOnce(&mut BerWriter)) {
        self.constructed(CLASS_APPLICATION, tag, f);
    }
}

/// Minimal-length two's-complement big-endian content octets
pub(crate) fn int_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let b = bytes[start];
        let next_msb = bytes[start + 1] & 0x80;
        if (b == 0x00 && next_msb == 0) || (b == 0xff && next_msb != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn integer_minimal_encoding() {
        assert_eq!(int_content(0), &[0x00]);
        assert_eq!(int_content(127), &[0x7f]);
        assert_eq!(int_content(128), &[0x00, 0x80]);
        assert_eq!(int_content(256), &[0x01, 0x00]);
        assert_eq!(int_content(-1), &[0xff]);
        assert_eq!(int_content(-129), &[0xff, 0x7f]);
    }

    #[test]
    fn short_and_long_lengths() {
        let mut w = BerWriter::new();
        w.octet_string(&[0x41; 2]);
        assert_eq!(w.into_bytes().as_ref(), &hex!("04 02 41 41"));

        let mut w = BerWriter::new();
        w.octet_string(&[0x41; 130]);
        let out = w.into_bytes();
        assert_eq!(&out[..3], &hex!("04 81 82"));
        assert_eq!(out.len(), 3 + 130);
    }

    #[test]
    fn nested_constructed() {
        let mut w = BerWriter::new();
        w.sequence(|w| {
            w.integer(5);
            w.boolean(true);
        });
        assert_eq!(w.into_bytes().as_ref(), &hex!("30 06 02 01 05 01 01 ff"));
    }
}
