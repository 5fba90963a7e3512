//! # BER Codec
//!
//! Typed ASN.1 values and their Basic Encoding Rules wire form (X.690), limited
//! to the subset LDAP uses.
//!
//! ## Identifier octets
//! ```text
//! bits 8-7: class (00 Universal, 01 Application, 10 Context, 11 Private)
//! bit  6:   constructed
//! bits 5-1: tag number, or 11111 followed by base-128 continuation octets
//! ```
//!
//! ## Lengths
//! Definite form only. Short form for lengths below 128, long form otherwise.
//! The indefinite form (`0x80`) is rejected on decode.
//!
//! ## Tagged values
//! An explicit tag wraps the complete inner encoding in a new constructed TLV.
//! An implicit tag replaces only the identifier and reuses the inner content.
//! Without a schema the two cannot always be told apart on the wire, so the
//! generic decoder produces a canonical shape:
//! - non-universal primitive: implicit tag over an `OctetString` holding the raw content
//! - non-universal constructed with exactly one element: explicit tag over that element
//! - non-universal constructed otherwise: implicit tag over a `Sequence`
//!
//! Schema-directed callers use [`Asn1Value::into_components`],
//! [`Asn1Value::implicit_content`] and [`Asn1Value::reinterpret`] to recover the
//! intended types.

use crate::error::{DecodingError, DecodingErrorKind};

/// Universal tag numbers used by LDAP
pub mod universal {
    pub const BOOLEAN: u32 = 1;
    pub const INTEGER: u32 = 2;
    pub const OCTET_STRING: u32 = 4;
    pub const NULL: u32 = 5;
    pub const ENUMERATED: u32 = 10;
    pub const SEQUENCE: u32 = 16;
    pub const SET: u32 = 17;
}

/// Constructed bit in the first identifier octet
const CONSTRUCTED_BIT: u8 = 0x20;
/// Low five bits set: tag number follows in continuation octets
const HIGH_TAG_MARKER: u8 = 0x1F;

/// Deepest constructed nesting the decoder accepts. The outermost value is depth 1.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    #[inline]
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::Context => 0x80,
            TagClass::Private => 0xC0,
        }
    }

    #[inline]
    fn from_octet(octet: u8) -> Self {
        match octet & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::Context,
            _ => TagClass::Private,
        }
    }
}

/// Class, form and tag number of a BER value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub class: TagClass,
    pub constructed: bool,
    pub tag: u32,
}

impl Identifier {
    pub const fn new(class: TagClass, constructed: bool, tag: u32) -> Self {
        Self {
            class,
            constructed,
            tag,
        }
    }

    pub const fn universal(tag: u32, constructed: bool) -> Self {
        Self::new(TagClass::Universal, constructed, tag)
    }

    pub const fn application(tag: u32, constructed: bool) -> Self {
        Self::new(TagClass::Application, constructed, tag)
    }

    pub const fn context(tag: u32, constructed: bool) -> Self {
        Self::new(TagClass::Context, constructed, tag)
    }

    /// Same class and tag number, ignoring the constructed bit
    #[inline]
    pub fn same_tag(&self, class: TagClass, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    /// Append the identifier octet(s)
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut first = self.class.bits();
        if self.constructed {
            first |= CONSTRUCTED_BIT;
        }

        if self.tag < HIGH_TAG_MARKER as u32 {
            out.push(first | self.tag as u8);
            return;
        }

        out.push(first | HIGH_TAG_MARKER);
        let mut groups = [0u8; 5];
        let mut count = 0;
        let mut tag = self.tag;
        loop {
            groups[count] = (tag & 0x7F) as u8;
            count += 1;
            tag >>= 7;
            if tag == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            let continuation = if i > 0 { 0x80 } else { 0x00 };
            out.push(groups[i] | continuation);
        }
    }
}

/// A typed ASN.1 value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asn1Value {
    Boolean(bool),
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    Enumerated(i64),
    Sequence(Vec<Asn1Value>),
    Set(Vec<Asn1Value>),
    Tagged {
        id: Identifier,
        inner: Box<Asn1Value>,
        explicit: bool,
    },
}

impl Asn1Value {
    /// Explicitly tag `inner`; the wrapper is always constructed
    pub fn explicit(class: TagClass, tag: u32, inner: Asn1Value) -> Self {
        Asn1Value::Tagged {
            id: Identifier::new(class, true, tag),
            inner: Box::new(inner),
            explicit: true,
        }
    }

    /// Implicitly tag `inner`; the form follows the inner value
    pub fn implicit(class: TagClass, tag: u32, inner: Asn1Value) -> Self {
        let constructed = inner.identifier().constructed;
        Asn1Value::Tagged {
            id: Identifier::new(class, constructed, tag),
            inner: Box::new(inner),
            explicit: false,
        }
    }

    /// Convenience for `[n] IMPLICIT OCTET STRING` in context class
    pub fn context_bytes(tag: u32, bytes: impl Into<Vec<u8>>) -> Self {
        Self::implicit(TagClass::Context, tag, Asn1Value::OctetString(bytes.into()))
    }

    /// Convenience for a UTF-8 OCTET STRING
    pub fn string(s: &str) -> Self {
        Asn1Value::OctetString(s.as_bytes().to_vec())
    }

    /// The identifier this value carries on the wire
    pub fn identifier(&self) -> Identifier {
        match self {
            Asn1Value::Boolean(_) => Identifier::universal(universal::BOOLEAN, false),
            Asn1Value::Integer(_) => Identifier::universal(universal::INTEGER, false),
            Asn1Value::OctetString(_) => Identifier::universal(universal::OCTET_STRING, false),
            Asn1Value::Null => Identifier::universal(universal::NULL, false),
            Asn1Value::Enumerated(_) => Identifier::universal(universal::ENUMERATED, false),
            Asn1Value::Sequence(_) => Identifier::universal(universal::SEQUENCE, true),
            Asn1Value::Set(_) => Identifier::universal(universal::SET, true),
            Asn1Value::Tagged {
                id,
                inner,
                explicit,
            } => Identifier {
                class: id.class,
                tag: id.tag,
                constructed: *explicit || inner.identifier().constructed,
            },
        }
    }

    /// Append the full TLV encoding of this value
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut content = Vec::new();
        self.encode_content(&mut content);
        self.identifier().encode_into(out);
        encode_length(content.len(), out);
        out.extend_from_slice(&content);
    }

    fn encode_content(&self, out: &mut Vec<u8>) {
        match self {
            Asn1Value::Boolean(v) => out.push(if *v { 0xFF } else { 0x00 }),
            Asn1Value::Integer(v) | Asn1Value::Enumerated(v) => encode_integer(*v, out),
            Asn1Value::OctetString(bytes) => out.extend_from_slice(bytes),
            Asn1Value::Null => {}
            Asn1Value::Sequence(items) | Asn1Value::Set(items) => {
                for item in items {
                    item.encode_into(out);
                }
            }
            Asn1Value::Tagged {
                inner, explicit, ..
            } => {
                if *explicit {
                    inner.encode_into(out);
                } else {
                    inner.encode_content(out);
                }
            }
        }
    }

    /// Elements of a constructed value, in wire order.
    ///
    /// Accepts a SEQUENCE/SET, an explicit tag (one element) or an implicit tag
    /// over a SEQUENCE/SET. Returns `None` for primitive values.
    pub fn into_components(self) -> Option<Vec<Asn1Value>> {
        match self {
            Asn1Value::Sequence(items) | Asn1Value::Set(items) => Some(items),
            Asn1Value::Tagged {
                inner,
                explicit: true,
                ..
            } => Some(vec![*inner]),
            Asn1Value::Tagged {
                inner,
                explicit: false,
                ..
            } => match *inner {
                Asn1Value::Sequence(items) | Asn1Value::Set(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    /// Raw content octets of an implicitly tagged primitive value
    pub fn implicit_content(&self) -> Option<&[u8]> {
        match self {
            Asn1Value::Tagged {
                inner,
                explicit: false,
                ..
            } => match inner.as_ref() {
                Asn1Value::OctetString(bytes) => Some(bytes),
                _ => None,
            },
            _ => None,
        }
    }

    /// Re-read an implicitly tagged primitive as the given universal type,
    /// keeping its tag.
    pub fn reinterpret(self, universal_tag: u32) -> Result<Asn1Value, DecodingError> {
        let (id, content) = match self {
            Asn1Value::Tagged {
                id,
                inner,
                explicit: false,
            } => match *inner {
                Asn1Value::OctetString(bytes) => (id, bytes),
                other => return Ok(Asn1Value::implicit(id.class, id.tag, other)),
            },
            other => return Ok(other),
        };
        let end = content.len();
        let inner = decode_content(
            Identifier::universal(universal_tag, false),
            &content,
            0,
            end,
            0,
        )?;
        Ok(Asn1Value::implicit(id.class, id.tag, inner))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Asn1Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Asn1Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enumerated(&self) -> Option<i64> {
        match self {
            Asn1Value::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Asn1Value::OctetString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Asn1Value::OctetString(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Encode a value to its BER bytes
pub fn encode(value: &Asn1Value) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode_into(&mut out);
    out
}

/// Decode one value from the start of `bytes`.
///
/// Returns the value and the number of bytes it occupied. Trailing bytes are
/// left for the caller.
pub fn decode(bytes: &[u8]) -> Result<(Asn1Value, usize), DecodingError> {
    decode_at(bytes, 0, bytes.len(), 1)
}

/// Decode exactly one value occupying the whole buffer
pub fn decode_exact(bytes: &[u8]) -> Result<Asn1Value, DecodingError> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodingError::new(consumed, DecodingErrorKind::TrailingData));
    }
    Ok(value)
}

/// Total length of the TLV starting at `bytes[0]`, once enough of the header
/// has arrived to know it. `Ok(None)` means more bytes are needed.
pub fn peek_frame_len(bytes: &[u8]) -> Result<Option<usize>, DecodingError> {
    match parse_header(bytes, 0, bytes.len())? {
        Header::Complete {
            len, header_len, ..
        } => header_len
            .checked_add(len)
            .map(Some)
            .ok_or_else(|| DecodingError::new(0, DecodingErrorKind::LengthOverflow)),
        Header::Incomplete { .. } => Ok(None),
    }
}

/// Minimal two's-complement big-endian encoding
fn encode_integer(value: i64, out: &mut Vec<u8>) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    out.extend_from_slice(&bytes[start..]);
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

enum Header {
    Complete {
        id: Identifier,
        len: usize,
        header_len: usize,
    },
    /// Ran out of input; carries the error a complete decode would report
    Incomplete {
        offset: usize,
        kind: DecodingErrorKind,
    },
}

fn parse_header(buf: &[u8], pos: usize, end: usize) -> Result<Header, DecodingError> {
    if pos >= end {
        return Ok(Header::Incomplete {
            offset: pos,
            kind: DecodingErrorKind::Truncated,
        });
    }

    let first = buf[pos];
    let mut cursor = pos + 1;
    let mut tag = (first & HIGH_TAG_MARKER) as u32;

    if first & HIGH_TAG_MARKER == HIGH_TAG_MARKER {
        tag = 0;
        loop {
            if cursor >= end {
                return Ok(Header::Incomplete {
                    offset: cursor,
                    kind: DecodingErrorKind::MalformedTag,
                });
            }
            let octet = buf[cursor];
            if tag > (u32::MAX >> 7) {
                return Err(DecodingError::new(cursor, DecodingErrorKind::TagOverflow));
            }
            tag = (tag << 7) | (octet & 0x7F) as u32;
            cursor += 1;
            if octet & 0x80 == 0 {
                break;
            }
        }
    }

    let id = Identifier {
        class: TagClass::from_octet(first),
        constructed: first & CONSTRUCTED_BIT != 0,
        tag,
    };

    if cursor >= end {
        return Ok(Header::Incomplete {
            offset: cursor,
            kind: DecodingErrorKind::Truncated,
        });
    }

    let length_offset = cursor;
    let first_len = buf[cursor];
    cursor += 1;

    let len = if first_len & 0x80 == 0 {
        first_len as usize
    } else {
        let count = (first_len & 0x7F) as usize;
        if count == 0 {
            return Err(DecodingError::new(
                length_offset,
                DecodingErrorKind::IndefiniteLength,
            ));
        }
        if count == 0x7F || count > std::mem::size_of::<usize>() {
            return Err(DecodingError::new(
                length_offset,
                DecodingErrorKind::LengthOverflow,
            ));
        }
        if end - cursor < count {
            return Ok(Header::Incomplete {
                offset: cursor,
                kind: DecodingErrorKind::Truncated,
            });
        }
        let mut len = 0usize;
        for octet in &buf[cursor..cursor + count] {
            len = (len << 8) | *octet as usize;
        }
        cursor += count;
        len
    };

    Ok(Header::Complete {
        id,
        len,
        header_len: cursor - pos,
    })
}

fn decode_at(
    buf: &[u8],
    pos: usize,
    end: usize,
    depth: usize,
) -> Result<(Asn1Value, usize), DecodingError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DecodingError::new(pos, DecodingErrorKind::NestingTooDeep));
    }
    let (id, len, header_len) = match parse_header(buf, pos, end)? {
        Header::Complete {
            id,
            len,
            header_len,
        } => (id, len, header_len),
        Header::Incomplete { offset, kind } => return Err(DecodingError::new(offset, kind)),
    };

    let content_start = pos + header_len;
    let content_end = content_start
        .checked_add(len)
        .filter(|e| *e <= end)
        .ok_or_else(|| DecodingError::new(content_start, DecodingErrorKind::Truncated))?;

    let value = decode_content(id, buf, content_start, content_end, depth)?;
    Ok((value, content_end))
}

fn decode_children(
    buf: &[u8],
    start: usize,
    end: usize,
    depth: usize,
) -> Result<Vec<Asn1Value>, DecodingError> {
    let mut items = Vec::new();
    let mut pos = start;
    while pos < end {
        let (item, next) = decode_at(buf, pos, end, depth + 1)?;
        items.push(item);
        pos = next;
    }
    Ok(items)
}

fn decode_integer(content: &[u8], offset: usize) -> Result<i64, DecodingError> {
    if content.is_empty() {
        return Err(DecodingError::new(offset, DecodingErrorKind::InvalidInteger));
    }
    if content.len() > 8 {
        return Err(DecodingError::new(offset, DecodingErrorKind::IntegerOverflow));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for octet in content {
        value = (value << 8) | *octet as i64;
    }
    Ok(value)
}

fn decode_content(
    id: Identifier,
    buf: &[u8],
    start: usize,
    end: usize,
    depth: usize,
) -> Result<Asn1Value, DecodingError> {
    let content = &buf[start..end];

    if id.class != TagClass::Universal {
        if !id.constructed {
            return Ok(Asn1Value::Tagged {
                id,
                inner: Box::new(Asn1Value::OctetString(content.to_vec())),
                explicit: false,
            });
        }
        let mut children = decode_children(buf, start, end, depth)?;
        return Ok(if children.len() == 1 {
            Asn1Value::Tagged {
                id,
                inner: Box::new(children.remove(0)),
                explicit: true,
            }
        } else {
            Asn1Value::Tagged {
                id,
                inner: Box::new(Asn1Value::Sequence(children)),
                explicit: false,
            }
        });
    }

    match (id.tag, id.constructed) {
        (universal::BOOLEAN, false) => match content {
            [octet] => Ok(Asn1Value::Boolean(*octet != 0)),
            _ => Err(DecodingError::new(start, DecodingErrorKind::InvalidBoolean)),
        },
        (universal::INTEGER, false) => Ok(Asn1Value::Integer(decode_integer(content, start)?)),
        (universal::ENUMERATED, false) => {
            Ok(Asn1Value::Enumerated(decode_integer(content, start)?))
        }
        (universal::OCTET_STRING, false) => Ok(Asn1Value::OctetString(content.to_vec())),
        (universal::NULL, false) => {
            if content.is_empty() {
                Ok(Asn1Value::Null)
            } else {
                Err(DecodingError::new(start, DecodingErrorKind::InvalidNull))
            }
        }
        (universal::SEQUENCE, true) => Ok(Asn1Value::Sequence(decode_children(buf, start, end, depth)?)),
        (universal::SET, true) => Ok(Asn1Value::Set(decode_children(buf, start, end, depth)?)),
        _ => Err(DecodingError::new(start, DecodingErrorKind::UnexpectedTag)),
    }
}
