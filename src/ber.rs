// Incremental BER reader and writer for the subset of ASN.1 used by LDAP.
//
// The reader owns a growable buffer so a connection can append network reads
// as they arrive; type and length decoding progress survives between calls.

use std::mem;
use std::ops::Range;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{DecodeError, LdapError};

pub const UNIVERSAL_BOOLEAN_TYPE: u8 = 0x01;
pub const UNIVERSAL_INTEGER_TYPE: u8 = 0x02;
pub const UNIVERSAL_OCTET_STRING_TYPE: u8 = 0x04;
pub const UNIVERSAL_NULL_TYPE: u8 = 0x05;
pub const UNIVERSAL_ENUMERATED_TYPE: u8 = 0x0A;
pub const UNIVERSAL_SEQUENCE_TYPE: u8 = 0x30;
pub const UNIVERSAL_SET_TYPE: u8 = 0x31;

const MAX_LENGTH_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NeedType,
    NeedLength,
    NeedValue,
}

/// View into the reader's buffer. The root view has no end and grows with appended data.
#[derive(Debug, Clone, Copy)]
struct SubCursor {
    pos: usize,
    end: Option<usize>,
}

#[derive(Debug)]
pub struct BerReader {
    buffer: BytesMut,
    cursor: SubCursor,
    stack: Vec<SubCursor>,
    state: ReadState,
    peek_type: u8,
    peek_length: usize,
    max_element_size: usize,
}

impl BerReader {
    /// `max_element_size` of 0 disables the element size check.
    pub fn new(max_element_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            cursor: SubCursor { pos: 0, end: None },
            stack: Vec::new(),
            state: ReadState::NeedType,
            peek_type: 0,
            peek_length: 0,
            max_element_size,
        }
    }

    pub fn from_slice(data: &[u8], max_element_size: usize) -> Self {
        let mut reader = Self::new(max_element_size);
        reader.append(data);
        reader
    }

    /// Append freshly received bytes to the root buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes left in the current (innermost) element.
    pub fn remaining(&self) -> usize {
        let end = self.cursor.end.unwrap_or(self.buffer.len());
        end.saturating_sub(self.cursor.pos)
    }

    /// Number of sequences/sets currently open.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drop bytes already consumed at the top level.
    pub fn compact(&mut self) {
        if self.stack.is_empty() && self.cursor.pos > 0 {
            self.buffer.advance(self.cursor.pos);
            self.cursor.pos = 0;
        }
    }

    /// Removes the unread top-level bytes so they can be transformed and
    /// appended again. None while an element is partly consumed.
    pub fn take_unread(&mut self) -> Option<BytesMut> {
        if !self.stack.is_empty() || self.state != ReadState::NeedType {
            return None;
        }
        let unread = self.buffer.split_off(self.cursor.pos);
        self.buffer.clear();
        self.cursor.pos = 0;
        Some(unread)
    }

    pub fn peek_type(&mut self) -> Result<u8, DecodeError> {
        if self.state == ReadState::NeedType && !self.read_type_byte() {
            return Err(DecodeError::TruncatedType);
        }
        Ok(self.peek_type)
    }

    pub fn peek_length(&mut self) -> Result<usize, DecodeError> {
        self.peek_type()?;
        if self.state == ReadState::NeedLength && !self.read_length_bytes()? {
            return Err(DecodeError::TruncatedLength);
        }
        Ok(self.peek_length)
    }

    /// True when the next element's type, length and full value are buffered.
    /// Returns false (not an error) when more bytes are needed.
    pub fn element_available(&mut self) -> Result<bool, DecodeError> {
        if self.state == ReadState::NeedType && !self.read_type_byte() {
            return Ok(false);
        }
        if self.state == ReadState::NeedLength && !self.read_length_bytes()? {
            return Ok(false);
        }
        Ok(self.peek_length <= self.remaining())
    }

    /// True when at least the type byte of another element is available in the current view.
    pub fn has_next_element(&mut self) -> bool {
        self.state != ReadState::NeedType || self.read_type_byte()
    }

    fn read_type_byte(&mut self) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        self.peek_type = self.buffer[self.cursor.pos];
        self.cursor.pos += 1;
        self.state = ReadState::NeedLength;
        true
    }

    // Nothing is consumed until every length byte is buffered.
    fn read_length_bytes(&mut self) -> Result<bool, DecodeError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(false);
        }
        let pos = self.cursor.pos;
        let first = self.buffer[pos];
        let (length, consumed) = if first & 0x80 == 0 {
            (first as usize, 1)
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 {
                return Err(DecodeError::IndefiniteLength);
            }
            if count > MAX_LENGTH_BYTES {
                return Err(DecodeError::InvalidLengthBytes(count));
            }
            if remaining < 1 + count {
                return Ok(false);
            }
            let length = self.buffer[pos + 1..pos + 1 + count]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            (length, 1 + count)
        };
        self.cursor.pos += consumed;
        if self.max_element_size > 0 && length > self.max_element_size {
            return Err(DecodeError::ElementTooLarge {
                length,
                max: self.max_element_size,
            });
        }
        self.peek_length = length;
        self.state = ReadState::NeedValue;
        Ok(true)
    }

    fn take_value(&mut self, kind: &'static str) -> Result<Range<usize>, DecodeError> {
        let length = self.peek_length;
        let remaining = self.remaining();
        if remaining < length {
            return Err(DecodeError::TruncatedValue {
                kind,
                length,
                remaining,
            });
        }
        let start = self.cursor.pos;
        self.cursor.pos += length;
        self.state = ReadState::NeedType;
        Ok(start..start + length)
    }

    pub fn read_boolean(&mut self) -> Result<bool, DecodeError> {
        let length = self.peek_length()?;
        if length != 1 {
            return Err(DecodeError::InvalidLength {
                kind: "boolean",
                length,
            });
        }
        let range = self.take_value("boolean")?;
        Ok(self.buffer[range.start] != 0)
    }

    /// Two's-complement integer of 1 to 8 bytes, sign extended.
    pub fn read_integer(&mut self) -> Result<i64, DecodeError> {
        let length = self.peek_length()?;
        if length == 0 || length > 8 {
            return Err(DecodeError::InvalidLength {
                kind: "integer",
                length,
            });
        }
        self.read_signed("integer")
    }

    pub fn read_enumerated(&mut self) -> Result<i32, DecodeError> {
        let length = self.peek_length()?;
        if length == 0 || length > 4 {
            return Err(DecodeError::InvalidLength {
                kind: "enumerated",
                length,
            });
        }
        Ok(self.read_signed("enumerated")? as i32)
    }

    fn read_signed(&mut self, kind: &'static str) -> Result<i64, DecodeError> {
        let range = self.take_value(kind)?;
        let bytes = &self.buffer[range];
        let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in bytes {
            value = (value << 8) | b as i64;
        }
        Ok(value)
    }

    pub fn read_null(&mut self) -> Result<(), DecodeError> {
        let length = self.peek_length()?;
        if length != 0 {
            return Err(DecodeError::InvalidLength {
                kind: "null",
                length,
            });
        }
        self.state = ReadState::NeedType;
        Ok(())
    }

    pub fn read_octet_string(&mut self) -> Result<Vec<u8>, DecodeError> {
        self.peek_length()?;
        let range = self.take_value("octet string")?;
        Ok(self.buffer[range].to_vec())
    }

    pub fn read_octet_string_utf8(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8("octet string"))
    }

    pub fn read_start_sequence(&mut self) -> Result<(), DecodeError> {
        self.start_constructed("sequence")
    }

    pub fn read_start_set(&mut self) -> Result<(), DecodeError> {
        self.start_constructed("set")
    }

    fn start_constructed(&mut self, kind: &'static str) -> Result<(), DecodeError> {
        let length = self.peek_length()?;
        let remaining = self.remaining();
        if remaining < length {
            return Err(DecodeError::TruncatedValue {
                kind,
                length,
                remaining,
            });
        }
        let inner = SubCursor {
            pos: self.cursor.pos,
            end: Some(self.cursor.pos + length),
        };
        self.cursor.pos += length;
        self.stack.push(self.cursor);
        self.cursor = inner;
        self.state = ReadState::NeedType;
        Ok(())
    }

    pub fn read_end_sequence(&mut self) -> Result<(), DecodeError> {
        let parent = self.stack.pop().ok_or(DecodeError::SequenceNotStarted)?;
        let unused = self.remaining();
        if unused > 0 {
            trace!(unused, "ignoring trailing bytes at the end of a BER sequence");
        }
        self.cursor = parent;
        self.state = ReadState::NeedType;
        Ok(())
    }

    pub fn read_end_set(&mut self) -> Result<(), DecodeError> {
        self.read_end_sequence()
    }

    pub fn skip_element(&mut self) -> Result<(), DecodeError> {
        self.peek_length()?;
        self.take_value("element")?;
        Ok(())
    }
}

/// BER writer. Nested sequences are written into their own buffer and copied
/// into the parent with the measured length when they are closed.
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
    open: Vec<(u8, Vec<u8>)>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_header(&mut self, tag: u8, length: usize) {
        self.buffer.push(tag);
        write_length(&mut self.buffer, length);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_with_tag(UNIVERSAL_BOOLEAN_TYPE, value);
    }

    pub fn write_boolean_with_tag(&mut self, tag: u8, value: bool) {
        self.write_header(tag, 1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_integer_with_tag(UNIVERSAL_INTEGER_TYPE, value);
    }

    pub fn write_integer_with_tag(&mut self, tag: u8, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        // Strip leading bytes that only repeat the sign bit.
        while start < 7 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_header(tag, bytes.len() - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_integer_with_tag(UNIVERSAL_ENUMERATED_TYPE, value as i64);
    }

    pub fn write_null(&mut self) {
        self.write_null_with_tag(UNIVERSAL_NULL_TYPE);
    }

    pub fn write_null_with_tag(&mut self, tag: u8) {
        self.write_header(tag, 0);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_octet_string_with_tag(UNIVERSAL_OCTET_STRING_TYPE, data);
    }

    pub fn write_octet_string_with_tag(&mut self, tag: u8, data: &[u8]) {
        self.write_header(tag, data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_start_sequence(&mut self) {
        self.write_start_sequence_with_tag(UNIVERSAL_SEQUENCE_TYPE);
    }

    pub fn write_start_set(&mut self) {
        self.write_start_sequence_with_tag(UNIVERSAL_SET_TYPE);
    }

    pub fn write_start_sequence_with_tag(&mut self, tag: u8) {
        let parent = mem::take(&mut self.buffer);
        self.open.push((tag, parent));
    }

    pub fn write_end_sequence(&mut self) -> Result<(), LdapError> {
        let (tag, parent) = self
            .open
            .pop()
            .ok_or(LdapError::IllegalState("end of BER sequence without a matching start"))?;
        let content = mem::replace(&mut self.buffer, parent);
        self.write_header(tag, content.len());
        self.buffer.extend_from_slice(&content);
        Ok(())
    }

    pub fn write_end_set(&mut self) -> Result<(), LdapError> {
        self.write_end_sequence()
    }

    pub fn into_vec(self) -> Result<Vec<u8>, LdapError> {
        if !self.open.is_empty() {
            return Err(LdapError::IllegalState("BER sequence left open"));
        }
        Ok(self.buffer)
    }
}

fn write_length(buffer: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        buffer.push(length as u8);
        return;
    }
    let bytes = (length as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buffer.push(0x80 | (bytes.len() - skip) as u8);
    buffer.extend_from_slice(&bytes[skip..]);
}
