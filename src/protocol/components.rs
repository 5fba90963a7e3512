//! Schema-directed access to the elements of a decoded constructed value.

use std::iter::Peekable;
use std::vec::IntoIter;

use crate::core::ber::{universal, Asn1Value, TagClass};
use crate::error::{DecodingError, DecodingErrorKind};

pub(crate) type DecodeResult<T> = std::result::Result<T, DecodingError>;

pub(crate) fn malformed(context: &str, what: &str) -> DecodingError {
    DecodingError::malformed(0, format!("{context}: {what}"))
}

pub(crate) fn utf8(bytes: Vec<u8>) -> DecodeResult<String> {
    String::from_utf8(bytes).map_err(|e| {
        DecodingError::new(e.utf8_error().valid_up_to(), DecodingErrorKind::InvalidUtf8)
    })
}

/// Content of an implicitly tagged primitive, e.g. `[0] OCTET STRING`
pub(crate) fn tagged_bytes(value: &Asn1Value, context: &str) -> DecodeResult<Vec<u8>> {
    value
        .implicit_content()
        .map(|b| b.to_vec())
        .ok_or_else(|| malformed(context, "expected primitive tagged value"))
}

pub(crate) fn is_tag(value: &Asn1Value, class: TagClass, tag: u32) -> bool {
    matches!(value, Asn1Value::Tagged { id, .. } if id.same_tag(class, tag))
}

pub(crate) struct Components {
    items: Peekable<IntoIter<Asn1Value>>,
    context: &'static str,
}

impl Components {
    pub(crate) fn new(value: Asn1Value, context: &'static str) -> DecodeResult<Self> {
        let items = value
            .into_components()
            .ok_or_else(|| malformed(context, "expected constructed value"))?;
        Ok(Self::from_items(items, context))
    }

    pub(crate) fn from_items(items: Vec<Asn1Value>, context: &'static str) -> Self {
        Self {
            items: items.into_iter().peekable(),
            context,
        }
    }

    pub(crate) fn context(&self) -> &'static str {
        self.context
    }

    pub(crate) fn next(&mut self) -> DecodeResult<Asn1Value> {
        self.items
            .next()
            .ok_or_else(|| malformed(self.context, "missing element"))
    }

    pub(crate) fn next_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let context = self.context;
        self.next()?
            .into_bytes()
            .ok_or_else(|| malformed(context, "expected OCTET STRING"))
    }

    pub(crate) fn next_string(&mut self) -> DecodeResult<String> {
        utf8(self.next_bytes()?)
    }

    pub(crate) fn next_integer(&mut self) -> DecodeResult<i64> {
        let context = self.context;
        self.next()?
            .as_integer()
            .ok_or_else(|| malformed(context, "expected INTEGER"))
    }

    pub(crate) fn next_enumerated(&mut self) -> DecodeResult<i64> {
        let context = self.context;
        self.next()?
            .as_enumerated()
            .ok_or_else(|| malformed(context, "expected ENUMERATED"))
    }

    pub(crate) fn next_bool(&mut self) -> DecodeResult<bool> {
        let context = self.context;
        self.next()?
            .as_bool()
            .ok_or_else(|| malformed(context, "expected BOOLEAN"))
    }

    pub(crate) fn next_components(&mut self) -> DecodeResult<Components> {
        let context = self.context;
        Components::new(self.next()?, context)
    }

    /// Consume the next element only if it carries the given context tag
    pub(crate) fn next_if_context(&mut self, tag: u32) -> Option<Asn1Value> {
        match self.items.peek() {
            Some(v) if is_tag(v, TagClass::Context, tag) => self.items.next(),
            _ => None,
        }
    }

    /// Consume the next element only if it has the given universal type
    pub(crate) fn next_if_universal(&mut self, tag: u32) -> Option<Asn1Value> {
        match self.items.peek() {
            Some(v) if v.identifier().same_tag(TagClass::Universal, tag) => self.items.next(),
            _ => None,
        }
    }

    pub(crate) fn next_if_bool(&mut self) -> Option<bool> {
        self.next_if_universal(universal::BOOLEAN)
            .and_then(|v| v.as_bool())
    }

    pub(crate) fn next_if_bytes(&mut self) -> Option<Vec<u8>> {
        self.next_if_universal(universal::OCTET_STRING)
            .and_then(|v| v.into_bytes())
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.items.peek().is_none()
    }

    /// Remaining elements, in order
    pub(crate) fn rest(self) -> Vec<Asn1Value> {
        self.items.collect()
    }
}
