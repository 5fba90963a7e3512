//! Search filters (RFC 4511 §4.5.1.7) as a closed sum type.

use crate::core::ber::{Asn1Value, TagClass};
use crate::protocol::components::{malformed, tagged_bytes, utf8, Components, DecodeResult};

mod tag {
    pub const AND: u32 = 0;
    pub const OR: u32 = 1;
    pub const NOT: u32 = 2;
    pub const EQUALITY: u32 = 3;
    pub const SUBSTRINGS: u32 = 4;
    pub const GREATER_OR_EQUAL: u32 = 5;
    pub const LESS_OR_EQUAL: u32 = 6;
    pub const PRESENT: u32 = 7;
    pub const APPROX: u32 = 8;
    pub const EXTENSIBLE: u32 = 9;
}

/// Substring assertion pieces; at most one `initial` and one `final_value`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Substrings {
    pub attribute: String,
    pub initial: Option<Vec<u8>>,
    pub any: Vec<Vec<u8>>,
    pub final_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensibleMatch {
    pub matching_rule: Option<String>,
    pub attribute: Option<String>,
    pub value: Vec<u8>,
    pub dn_attributes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings(Substrings),
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible(ExtensibleMatch),
}

impl Filter {
    pub fn equality(attribute: &str, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality(attribute.to_string(), value.into())
    }

    pub fn present(attribute: &str) -> Self {
        Filter::Present(attribute.to_string())
    }

    /// `(objectClass=*)`
    pub fn any_object() -> Self {
        Filter::present("objectClass")
    }

    pub fn to_asn1(&self) -> Asn1Value {
        match self {
            Filter::And(items) => set_of(tag::AND, items),
            Filter::Or(items) => set_of(tag::OR, items),
            Filter::Not(inner) => Asn1Value::explicit(TagClass::Context, tag::NOT, inner.to_asn1()),
            Filter::Equality(attr, value) => assertion(tag::EQUALITY, attr, value),
            Filter::GreaterOrEqual(attr, value) => assertion(tag::GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual(attr, value) => assertion(tag::LESS_OR_EQUAL, attr, value),
            Filter::Approx(attr, value) => assertion(tag::APPROX, attr, value),
            Filter::Present(attr) => Asn1Value::context_bytes(tag::PRESENT, attr.as_bytes()),
            Filter::Substrings(sub) => {
                let mut pieces = Vec::new();
                if let Some(initial) = &sub.initial {
                    pieces.push(Asn1Value::context_bytes(0, initial.clone()));
                }
                for any in &sub.any {
                    pieces.push(Asn1Value::context_bytes(1, any.clone()));
                }
                if let Some(final_value) = &sub.final_value {
                    pieces.push(Asn1Value::context_bytes(2, final_value.clone()));
                }
                Asn1Value::implicit(
                    TagClass::Context,
                    tag::SUBSTRINGS,
                    Asn1Value::Sequence(vec![
                        Asn1Value::string(&sub.attribute),
                        Asn1Value::Sequence(pieces),
                    ]),
                )
            }
            Filter::Extensible(ext) => {
                let mut items = Vec::new();
                if let Some(rule) = &ext.matching_rule {
                    items.push(Asn1Value::context_bytes(1, rule.as_bytes()));
                }
                if let Some(attr) = &ext.attribute {
                    items.push(Asn1Value::context_bytes(2, attr.as_bytes()));
                }
                items.push(Asn1Value::context_bytes(3, ext.value.clone()));
                if ext.dn_attributes {
                    items.push(Asn1Value::implicit(
                        TagClass::Context,
                        4,
                        Asn1Value::Boolean(true),
                    ));
                }
                Asn1Value::implicit(TagClass::Context, tag::EXTENSIBLE, Asn1Value::Sequence(items))
            }
        }
    }

    pub fn from_asn1(value: Asn1Value) -> DecodeResult<Self> {
        const CONTEXT: &str = "Filter";
        let id = match &value {
            Asn1Value::Tagged { id, .. } if id.class == TagClass::Context => *id,
            _ => return Err(malformed(CONTEXT, "expected context-tagged choice")),
        };

        match id.tag {
            tag::AND | tag::OR => {
                let items = Components::new(value, CONTEXT)?
                    .rest()
                    .into_iter()
                    .map(Filter::from_asn1)
                    .collect::<DecodeResult<Vec<_>>>()?;
                Ok(if id.tag == tag::AND {
                    Filter::And(items)
                } else {
                    Filter::Or(items)
                })
            }
            tag::NOT => {
                let mut parts = Components::new(value, CONTEXT)?;
                Ok(Filter::Not(Box::new(Filter::from_asn1(parts.next()?)?)))
            }
            tag::EQUALITY | tag::GREATER_OR_EQUAL | tag::LESS_OR_EQUAL | tag::APPROX => {
                let mut parts = Components::new(value, CONTEXT)?;
                let attr = parts.next_string()?;
                let assertion = parts.next_bytes()?;
                Ok(match id.tag {
                    tag::EQUALITY => Filter::Equality(attr, assertion),
                    tag::GREATER_OR_EQUAL => Filter::GreaterOrEqual(attr, assertion),
                    tag::LESS_OR_EQUAL => Filter::LessOrEqual(attr, assertion),
                    _ => Filter::Approx(attr, assertion),
                })
            }
            tag::PRESENT => Ok(Filter::Present(utf8(tagged_bytes(&value, CONTEXT)?)?)),
            tag::SUBSTRINGS => {
                let mut parts = Components::new(value, CONTEXT)?;
                let mut sub = Substrings {
                    attribute: parts.next_string()?,
                    ..Default::default()
                };
                for piece in parts.next_components()?.rest() {
                    let bytes = tagged_bytes(&piece, CONTEXT)?;
                    match piece.identifier().tag {
                        0 => sub.initial = Some(bytes),
                        1 => sub.any.push(bytes),
                        2 => sub.final_value = Some(bytes),
                        _ => return Err(malformed(CONTEXT, "unknown substring choice")),
                    }
                }
                Ok(Filter::Substrings(sub))
            }
            tag::EXTENSIBLE => {
                let mut parts = Components::new(value, CONTEXT)?;
                let matching_rule = parts
                    .next_if_context(1)
                    .map(|v| tagged_bytes(&v, CONTEXT).and_then(utf8))
                    .transpose()?;
                let attribute = parts
                    .next_if_context(2)
                    .map(|v| tagged_bytes(&v, CONTEXT).and_then(utf8))
                    .transpose()?;
                let value = parts
                    .next_if_context(3)
                    .ok_or_else(|| malformed(CONTEXT, "missing matchValue"))
                    .and_then(|v| tagged_bytes(&v, CONTEXT))?;
                let dn_attributes = match parts.next_if_context(4) {
                    Some(v) => tagged_bytes(&v, CONTEXT)?.first().is_some_and(|b| *b != 0),
                    None => false,
                };
                Ok(Filter::Extensible(ExtensibleMatch {
                    matching_rule,
                    attribute,
                    value,
                    dn_attributes,
                }))
            }
            _ => Err(malformed(CONTEXT, "unknown filter choice")),
        }
    }
}

fn set_of(tag: u32, items: &[Filter]) -> Asn1Value {
    Asn1Value::implicit(
        TagClass::Context,
        tag,
        Asn1Value::Set(items.iter().map(Filter::to_asn1).collect()),
    )
}

fn assertion(tag: u32, attr: &str, value: &[u8]) -> Asn1Value {
    Asn1Value::implicit(
        TagClass::Context,
        tag,
        Asn1Value::Sequence(vec![
            Asn1Value::string(attr),
            Asn1Value::OctetString(value.to_vec()),
        ]),
    )
}
