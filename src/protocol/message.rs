//! # LDAP Message Envelope
//!
//! `LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }`
//! (RFC 4511 §4.1.1) with every protocol operation in both directions.
//!
//! Encoding builds an [`Asn1Value`] tree and hands it to the BER codec.
//! Decoding first parses the generic BER shape, then walks it with the
//! schema of each operation to recover implicitly tagged fields.

use std::fmt;

use crate::core::ber::{self, universal, Asn1Value, TagClass};
use crate::error::{LdapError, Result};
use crate::protocol::components::{
    malformed, tagged_bytes, utf8, Components, DecodeResult,
};
use crate::protocol::filter::Filter;

/// APPLICATION tag numbers of the protocolOp choice
pub mod op_tag {
    pub const BIND_REQUEST: u32 = 0;
    pub const BIND_RESPONSE: u32 = 1;
    pub const UNBIND_REQUEST: u32 = 2;
    pub const SEARCH_REQUEST: u32 = 3;
    pub const SEARCH_RESULT_ENTRY: u32 = 4;
    pub const SEARCH_RESULT_DONE: u32 = 5;
    pub const MODIFY_REQUEST: u32 = 6;
    pub const MODIFY_RESPONSE: u32 = 7;
    pub const ADD_REQUEST: u32 = 8;
    pub const ADD_RESPONSE: u32 = 9;
    pub const DEL_REQUEST: u32 = 10;
    pub const DEL_RESPONSE: u32 = 11;
    pub const MODIFY_DN_REQUEST: u32 = 12;
    pub const MODIFY_DN_RESPONSE: u32 = 13;
    pub const COMPARE_REQUEST: u32 = 14;
    pub const COMPARE_RESPONSE: u32 = 15;
    pub const ABANDON_REQUEST: u32 = 16;
    pub const SEARCH_RESULT_REFERENCE: u32 = 19;
    pub const EXTENDED_REQUEST: u32 = 23;
    pub const EXTENDED_RESPONSE: u32 = 24;
    pub const INTERMEDIATE_RESPONSE: u32 = 25;
}

/// Well-known object identifiers
pub mod oids {
    pub const START_TLS: &str = "1.3.6.1.4.1.1466.20037";
    pub const NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";
    pub const WHO_AM_I: &str = "1.3.6.1.4.1.4203.1.11.3";
    pub const MANAGE_DSA_IT: &str = "2.16.840.1.113730.3.4.2";
}

/// LDAP protocol version sent in bind requests
pub const LDAP_VERSION: i64 = 3;

/// Largest legal message ID (`maxInt` in RFC 4511)
pub const MAX_MESSAGE_ID: i32 = i32::MAX;

macro_rules! result_codes {
    ($($name:ident = $code:literal => $label:literal),* $(,)?) => {
        /// LDAP result codes (RFC 4511 Appendix A)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultCode {
            $($name,)*
            /// Any code without a named variant, including `other (80)`
            Other(i32),
        }

        impl ResultCode {
            pub fn code(self) -> i32 {
                match self {
                    $(ResultCode::$name => $code,)*
                    ResultCode::Other(code) => code,
                }
            }

            fn label(self) -> &'static str {
                match self {
                    $(ResultCode::$name => $label,)*
                    ResultCode::Other(_) => "other",
                }
            }
        }

        impl From<i32> for ResultCode {
            fn from(code: i32) -> Self {
                match code {
                    $($code => ResultCode::$name,)*
                    other => ResultCode::Other(other),
                }
            }
        }
    };
}

result_codes! {
    Success = 0 => "success",
    OperationsError = 1 => "operationsError",
    ProtocolError = 2 => "protocolError",
    TimeLimitExceeded = 3 => "timeLimitExceeded",
    SizeLimitExceeded = 4 => "sizeLimitExceeded",
    CompareFalse = 5 => "compareFalse",
    CompareTrue = 6 => "compareTrue",
    AuthMethodNotSupported = 7 => "authMethodNotSupported",
    StrongerAuthRequired = 8 => "strongerAuthRequired",
    Referral = 10 => "referral",
    AdminLimitExceeded = 11 => "adminLimitExceeded",
    UnavailableCriticalExtension = 12 => "unavailableCriticalExtension",
    ConfidentialityRequired = 13 => "confidentialityRequired",
    SaslBindInProgress = 14 => "saslBindInProgress",
    NoSuchAttribute = 16 => "noSuchAttribute",
    UndefinedAttributeType = 17 => "undefinedAttributeType",
    InappropriateMatching = 18 => "inappropriateMatching",
    ConstraintViolation = 19 => "constraintViolation",
    AttributeOrValueExists = 20 => "attributeOrValueExists",
    InvalidAttributeSyntax = 21 => "invalidAttributeSyntax",
    NoSuchObject = 32 => "noSuchObject",
    AliasProblem = 33 => "aliasProblem",
    InvalidDnSyntax = 34 => "invalidDNSyntax",
    AliasDereferencingProblem = 36 => "aliasDereferencingProblem",
    InappropriateAuthentication = 48 => "inappropriateAuthentication",
    InvalidCredentials = 49 => "invalidCredentials",
    InsufficientAccessRights = 50 => "insufficientAccessRights",
    Busy = 51 => "busy",
    Unavailable = 52 => "unavailable",
    UnwillingToPerform = 53 => "unwillingToPerform",
    LoopDetect = 54 => "loopDetect",
    NamingViolation = 64 => "namingViolation",
    ObjectClassViolation = 65 => "objectClassViolation",
    NotAllowedOnNonLeaf = 66 => "notAllowedOnNonLeaf",
    NotAllowedOnRdn = 67 => "notAllowedOnRDN",
    EntryAlreadyExists = 68 => "entryAlreadyExists",
    ObjectClassModsProhibited = 69 => "objectClassModsProhibited",
    AffectsMultipleDsas = 71 => "affectsMultipleDSAs",
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.code())
    }
}

/// `LDAPResult` components shared by every response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
    pub referral: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: String::new(),
            referral: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }

    /// Protocol error carrying this result's code and diagnostic message
    pub fn to_error(&self) -> LdapError {
        LdapError::Result {
            code: self.code,
            matched_dn: self.matched_dn.clone(),
            message: self.message.clone(),
        }
    }

    /// `Ok(self)` on success, the protocol error otherwise
    pub fn check(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    fn push_components(&self, out: &mut Vec<Asn1Value>) {
        out.push(Asn1Value::Enumerated(i64::from(self.code.code())));
        out.push(Asn1Value::string(&self.matched_dn));
        out.push(Asn1Value::string(&self.message));
        if !self.referral.is_empty() {
            out.push(Asn1Value::implicit(
                TagClass::Context,
                3,
                Asn1Value::Sequence(self.referral.iter().map(|u| Asn1Value::string(u)).collect()),
            ));
        }
    }

    fn read(parts: &mut Components) -> DecodeResult<Self> {
        let raw = parts.next_enumerated()?;
        let code = i32::try_from(raw)
            .map_err(|_| malformed(parts.context(), "result code out of range"))?;
        let matched_dn = parts.next_string()?;
        let message = parts.next_string()?;
        let referral = match parts.next_if_context(3) {
            Some(v) => read_strings(v, parts.context())?,
            None => Vec::new(),
        };
        Ok(Self {
            code: ResultCode::from(code),
            matched_dn,
            message,
            referral,
        })
    }

    fn to_asn1(&self, tag: u32) -> Asn1Value {
        let mut items = Vec::new();
        self.push_components(&mut items);
        application(tag, items)
    }

    fn from_asn1(value: Asn1Value, context: &'static str) -> DecodeResult<Self> {
        let mut parts = Components::new(value, context)?;
        Self::read(&mut parts)
    }
}

/// A control attached to a request or response: OID, criticality and opaque value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }

    fn to_asn1(&self) -> Asn1Value {
        let mut items = vec![Asn1Value::string(&self.oid)];
        // DEFAULT FALSE is omitted
        if self.critical {
            items.push(Asn1Value::Boolean(true));
        }
        if let Some(value) = &self.value {
            items.push(Asn1Value::OctetString(value.clone()));
        }
        Asn1Value::Sequence(items)
    }

    fn from_asn1(value: Asn1Value) -> DecodeResult<Self> {
        let mut parts = Components::new(value, "Control")?;
        let oid = parts.next_string()?;
        let critical = parts.next_if_bool().unwrap_or(false);
        let value = parts.next_if_bytes();
        Ok(Self {
            oid,
            critical,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    pub fn sasl(
        name: impl Into<String>,
        mechanism: impl Into<String>,
        credentials: Option<Vec<u8>>,
    ) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// An attribute description with its values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl PartialAttribute {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn to_asn1(&self) -> Asn1Value {
        Asn1Value::Sequence(vec![
            Asn1Value::string(&self.name),
            Asn1Value::Set(
                self.values
                    .iter()
                    .map(|v| Asn1Value::OctetString(v.clone()))
                    .collect(),
            ),
        ])
    }

    fn from_asn1(value: Asn1Value) -> DecodeResult<Self> {
        let mut parts = Components::new(value, "PartialAttribute")?;
        let name = parts.next_string()?;
        let values = parts
            .next_components()?
            .rest()
            .into_iter()
            .map(|v| {
                v.into_bytes()
                    .ok_or_else(|| malformed("PartialAttribute", "expected OCTET STRING value"))
            })
            .collect::<DecodeResult<Vec<_>>>()?;
        Ok(Self { name, values })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub dn: String,
    pub attributes: Vec<PartialAttribute>,
}

impl SearchResultEntry {
    /// Values of the first attribute matching `name`, case-insensitively
    pub fn values(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.values.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: PartialAttribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<PartialAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(name: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// The `protocolOp` choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    pub fn tag(&self) -> u32 {
        match self {
            ProtocolOp::BindRequest(_) => op_tag::BIND_REQUEST,
            ProtocolOp::BindResponse(_) => op_tag::BIND_RESPONSE,
            ProtocolOp::UnbindRequest => op_tag::UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => op_tag::SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => op_tag::SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => op_tag::SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => op_tag::SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => op_tag::MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => op_tag::MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => op_tag::ADD_REQUEST,
            ProtocolOp::AddResponse(_) => op_tag::ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => op_tag::DEL_REQUEST,
            ProtocolOp::DelResponse(_) => op_tag::DEL_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => op_tag::MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => op_tag::MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => op_tag::COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => op_tag::COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => op_tag::ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => op_tag::EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => op_tag::EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => op_tag::INTERMEDIATE_RESPONSE,
        }
    }

    /// Short operation name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bindRequest",
            ProtocolOp::BindResponse(_) => "bindResponse",
            ProtocolOp::UnbindRequest => "unbindRequest",
            ProtocolOp::SearchRequest(_) => "searchRequest",
            ProtocolOp::SearchResultEntry(_) => "searchResEntry",
            ProtocolOp::SearchResultReference(_) => "searchResRef",
            ProtocolOp::SearchResultDone(_) => "searchResDone",
            ProtocolOp::ModifyRequest(_) => "modifyRequest",
            ProtocolOp::ModifyResponse(_) => "modifyResponse",
            ProtocolOp::AddRequest(_) => "addRequest",
            ProtocolOp::AddResponse(_) => "addResponse",
            ProtocolOp::DelRequest(_) => "delRequest",
            ProtocolOp::DelResponse(_) => "delResponse",
            ProtocolOp::ModifyDnRequest(_) => "modDNRequest",
            ProtocolOp::ModifyDnResponse(_) => "modDNResponse",
            ProtocolOp::CompareRequest(_) => "compareRequest",
            ProtocolOp::CompareResponse(_) => "compareResponse",
            ProtocolOp::AbandonRequest(_) => "abandonRequest",
            ProtocolOp::ExtendedRequest(_) => "extendedReq",
            ProtocolOp::ExtendedResponse(_) => "extendedResp",
            ProtocolOp::IntermediateResponse(_) => "intermediateResponse",
        }
    }

    /// Non-terminal fragments of a multi-message response
    pub fn is_fragment(&self) -> bool {
        matches!(
            self,
            ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::IntermediateResponse(_)
        )
    }

    /// The `LDAPResult` of a response operation
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            _ => None,
        }
    }

    pub fn to_asn1(&self) -> Asn1Value {
        match self {
            ProtocolOp::BindRequest(req) => {
                let auth = match &req.authentication {
                    BindAuthentication::Simple(password) => {
                        Asn1Value::context_bytes(0, password.clone())
                    }
                    BindAuthentication::Sasl {
                        mechanism,
                        credentials,
                    } => {
                        let mut items = vec![Asn1Value::string(mechanism)];
                        if let Some(creds) = credentials {
                            items.push(Asn1Value::OctetString(creds.clone()));
                        }
                        Asn1Value::implicit(TagClass::Context, 3, Asn1Value::Sequence(items))
                    }
                };
                application(
                    op_tag::BIND_REQUEST,
                    vec![
                        Asn1Value::Integer(req.version),
                        Asn1Value::string(&req.name),
                        auth,
                    ],
                )
            }
            ProtocolOp::BindResponse(resp) => {
                let mut items = Vec::new();
                resp.result.push_components(&mut items);
                if let Some(creds) = &resp.server_sasl_creds {
                    items.push(Asn1Value::context_bytes(7, creds.clone()));
                }
                application(op_tag::BIND_RESPONSE, items)
            }
            ProtocolOp::UnbindRequest => {
                Asn1Value::implicit(TagClass::Application, op_tag::UNBIND_REQUEST, Asn1Value::Null)
            }
            ProtocolOp::SearchRequest(req) => application(
                op_tag::SEARCH_REQUEST,
                vec![
                    Asn1Value::string(&req.base_dn),
                    Asn1Value::Enumerated(req.scope as i64),
                    Asn1Value::Enumerated(req.deref_aliases as i64),
                    Asn1Value::Integer(i64::from(req.size_limit)),
                    Asn1Value::Integer(i64::from(req.time_limit)),
                    Asn1Value::Boolean(req.types_only),
                    req.filter.to_asn1(),
                    Asn1Value::Sequence(req.attributes.iter().map(|a| Asn1Value::string(a)).collect()),
                ],
            ),
            ProtocolOp::SearchResultEntry(entry) => application(
                op_tag::SEARCH_RESULT_ENTRY,
                vec![
                    Asn1Value::string(&entry.dn),
                    Asn1Value::Sequence(entry.attributes.iter().map(PartialAttribute::to_asn1).collect()),
                ],
            ),
            ProtocolOp::SearchResultReference(uris) => application(
                op_tag::SEARCH_RESULT_REFERENCE,
                uris.iter().map(|u| Asn1Value::string(u)).collect(),
            ),
            ProtocolOp::SearchResultDone(r) => r.to_asn1(op_tag::SEARCH_RESULT_DONE),
            ProtocolOp::ModifyRequest(req) => application(
                op_tag::MODIFY_REQUEST,
                vec![
                    Asn1Value::string(&req.dn),
                    Asn1Value::Sequence(
                        req.changes
                            .iter()
                            .map(|c| {
                                Asn1Value::Sequence(vec![
                                    Asn1Value::Enumerated(c.operation as i64),
                                    c.attribute.to_asn1(),
                                ])
                            })
                            .collect(),
                    ),
                ],
            ),
            ProtocolOp::ModifyResponse(r) => r.to_asn1(op_tag::MODIFY_RESPONSE),
            ProtocolOp::AddRequest(req) => application(
                op_tag::ADD_REQUEST,
                vec![
                    Asn1Value::string(&req.dn),
                    Asn1Value::Sequence(req.attributes.iter().map(PartialAttribute::to_asn1).collect()),
                ],
            ),
            ProtocolOp::AddResponse(r) => r.to_asn1(op_tag::ADD_RESPONSE),
            ProtocolOp::DelRequest(dn) => Asn1Value::implicit(
                TagClass::Application,
                op_tag::DEL_REQUEST,
                Asn1Value::string(dn),
            ),
            ProtocolOp::DelResponse(r) => r.to_asn1(op_tag::DEL_RESPONSE),
            ProtocolOp::ModifyDnRequest(req) => {
                let mut items = vec![
                    Asn1Value::string(&req.dn),
                    Asn1Value::string(&req.new_rdn),
                    Asn1Value::Boolean(req.delete_old_rdn),
                ];
                if let Some(superior) = &req.new_superior {
                    items.push(Asn1Value::context_bytes(0, superior.as_bytes()));
                }
                application(op_tag::MODIFY_DN_REQUEST, items)
            }
            ProtocolOp::ModifyDnResponse(r) => r.to_asn1(op_tag::MODIFY_DN_RESPONSE),
            ProtocolOp::CompareRequest(req) => application(
                op_tag::COMPARE_REQUEST,
                vec![
                    Asn1Value::string(&req.dn),
                    Asn1Value::Sequence(vec![
                        Asn1Value::string(&req.attribute),
                        Asn1Value::OctetString(req.value.clone()),
                    ]),
                ],
            ),
            ProtocolOp::CompareResponse(r) => r.to_asn1(op_tag::COMPARE_RESPONSE),
            ProtocolOp::AbandonRequest(id) => Asn1Value::implicit(
                TagClass::Application,
                op_tag::ABANDON_REQUEST,
                Asn1Value::Integer(i64::from(*id)),
            ),
            ProtocolOp::ExtendedRequest(req) => {
                let mut items = vec![Asn1Value::context_bytes(0, req.name.as_bytes())];
                if let Some(value) = &req.value {
                    items.push(Asn1Value::context_bytes(1, value.clone()));
                }
                application(op_tag::EXTENDED_REQUEST, items)
            }
            ProtocolOp::ExtendedResponse(resp) => {
                let mut items = Vec::new();
                resp.result.push_components(&mut items);
                if let Some(name) = &resp.name {
                    items.push(Asn1Value::context_bytes(10, name.as_bytes()));
                }
                if let Some(value) = &resp.value {
                    items.push(Asn1Value::context_bytes(11, value.clone()));
                }
                application(op_tag::EXTENDED_RESPONSE, items)
            }
            ProtocolOp::IntermediateResponse(resp) => {
                let mut items = Vec::new();
                if let Some(name) = &resp.name {
                    items.push(Asn1Value::context_bytes(0, name.as_bytes()));
                }
                if let Some(value) = &resp.value {
                    items.push(Asn1Value::context_bytes(1, value.clone()));
                }
                application(op_tag::INTERMEDIATE_RESPONSE, items)
            }
        }
    }

    pub fn from_asn1(value: Asn1Value) -> DecodeResult<Self> {
        let id = value.identifier();
        if id.class != TagClass::Application {
            return Err(malformed("protocolOp", "expected APPLICATION tag"));
        }

        let op = match id.tag {
            op_tag::BIND_REQUEST => {
                let mut parts = Components::new(value, "BindRequest")?;
                let version = parts.next_integer()?;
                let name = parts.next_string()?;
                let auth = parts.next()?;
                let authentication = match auth.identifier() {
                    a if a.same_tag(TagClass::Context, 0) => {
                        BindAuthentication::Simple(tagged_bytes(&auth, "BindRequest")?)
                    }
                    a if a.same_tag(TagClass::Context, 3) => {
                        let mut sasl = Components::new(auth, "SaslCredentials")?;
                        let mechanism = sasl.next_string()?;
                        let credentials = sasl.next_if_bytes();
                        BindAuthentication::Sasl {
                            mechanism,
                            credentials,
                        }
                    }
                    _ => return Err(malformed("BindRequest", "unknown authentication choice")),
                };
                ProtocolOp::BindRequest(BindRequest {
                    version,
                    name,
                    authentication,
                })
            }
            op_tag::BIND_RESPONSE => {
                let mut parts = Components::new(value, "BindResponse")?;
                let result = LdapResult::read(&mut parts)?;
                let server_sasl_creds = parts
                    .next_if_context(7)
                    .map(|v| tagged_bytes(&v, "BindResponse"))
                    .transpose()?;
                ProtocolOp::BindResponse(BindResponse {
                    result,
                    server_sasl_creds,
                })
            }
            op_tag::UNBIND_REQUEST => ProtocolOp::UnbindRequest,
            op_tag::SEARCH_REQUEST => {
                let mut parts = Components::new(value, "SearchRequest")?;
                let base_dn = parts.next_string()?;
                let scope = match parts.next_enumerated()? {
                    0 => SearchScope::BaseObject,
                    1 => SearchScope::SingleLevel,
                    2 => SearchScope::WholeSubtree,
                    _ => return Err(malformed("SearchRequest", "unknown scope")),
                };
                let deref_aliases = match parts.next_enumerated()? {
                    0 => DerefAliases::Never,
                    1 => DerefAliases::InSearching,
                    2 => DerefAliases::FindingBaseObject,
                    3 => DerefAliases::Always,
                    _ => return Err(malformed("SearchRequest", "unknown derefAliases")),
                };
                let size_limit = limit(parts.next_integer()?, "sizeLimit")?;
                let time_limit = limit(parts.next_integer()?, "timeLimit")?;
                let types_only = parts.next_bool()?;
                let filter = Filter::from_asn1(parts.next()?)?;
                let attributes = read_strings(parts.next()?, "SearchRequest")?;
                ProtocolOp::SearchRequest(SearchRequest {
                    base_dn,
                    scope,
                    deref_aliases,
                    size_limit,
                    time_limit,
                    types_only,
                    filter,
                    attributes,
                })
            }
            op_tag::SEARCH_RESULT_ENTRY => {
                let mut parts = Components::new(value, "SearchResultEntry")?;
                let dn = parts.next_string()?;
                let attributes = read_attributes(parts.next()?, "SearchResultEntry")?;
                ProtocolOp::SearchResultEntry(SearchResultEntry { dn, attributes })
            }
            op_tag::SEARCH_RESULT_REFERENCE => {
                ProtocolOp::SearchResultReference(read_strings(value, "SearchResultReference")?)
            }
            op_tag::SEARCH_RESULT_DONE => {
                ProtocolOp::SearchResultDone(LdapResult::from_asn1(value, "SearchResultDone")?)
            }
            op_tag::MODIFY_REQUEST => {
                let mut parts = Components::new(value, "ModifyRequest")?;
                let dn = parts.next_string()?;
                let changes = parts
                    .next_components()?
                    .rest()
                    .into_iter()
                    .map(read_modification)
                    .collect::<DecodeResult<Vec<_>>>()?;
                ProtocolOp::ModifyRequest(ModifyRequest { dn, changes })
            }
            op_tag::MODIFY_RESPONSE => {
                ProtocolOp::ModifyResponse(LdapResult::from_asn1(value, "ModifyResponse")?)
            }
            op_tag::ADD_REQUEST => {
                let mut parts = Components::new(value, "AddRequest")?;
                let dn = parts.next_string()?;
                let attributes = read_attributes(parts.next()?, "AddRequest")?;
                ProtocolOp::AddRequest(AddRequest { dn, attributes })
            }
            op_tag::ADD_RESPONSE => {
                ProtocolOp::AddResponse(LdapResult::from_asn1(value, "AddResponse")?)
            }
            op_tag::DEL_REQUEST => ProtocolOp::DelRequest(utf8(tagged_bytes(&value, "DelRequest")?)?),
            op_tag::DEL_RESPONSE => {
                ProtocolOp::DelResponse(LdapResult::from_asn1(value, "DelResponse")?)
            }
            op_tag::MODIFY_DN_REQUEST => {
                let mut parts = Components::new(value, "ModifyDNRequest")?;
                let dn = parts.next_string()?;
                let new_rdn = parts.next_string()?;
                let delete_old_rdn = parts.next_bool()?;
                let new_superior = parts
                    .next_if_context(0)
                    .map(|v| tagged_bytes(&v, "ModifyDNRequest").and_then(utf8))
                    .transpose()?;
                ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                    dn,
                    new_rdn,
                    delete_old_rdn,
                    new_superior,
                })
            }
            op_tag::MODIFY_DN_RESPONSE => {
                ProtocolOp::ModifyDnResponse(LdapResult::from_asn1(value, "ModifyDNResponse")?)
            }
            op_tag::COMPARE_REQUEST => {
                let mut parts = Components::new(value, "CompareRequest")?;
                let dn = parts.next_string()?;
                let mut ava = parts.next_components()?;
                let attribute = ava.next_string()?;
                let value = ava.next_bytes()?;
                ProtocolOp::CompareRequest(CompareRequest {
                    dn,
                    attribute,
                    value,
                })
            }
            op_tag::COMPARE_RESPONSE => {
                ProtocolOp::CompareResponse(LdapResult::from_asn1(value, "CompareResponse")?)
            }
            op_tag::ABANDON_REQUEST => {
                let raw = match value.reinterpret(universal::INTEGER)? {
                    Asn1Value::Tagged { inner, .. } => inner.as_integer(),
                    _ => None,
                }
                .ok_or_else(|| malformed("AbandonRequest", "expected INTEGER"))?;
                ProtocolOp::AbandonRequest(message_id(raw)?)
            }
            op_tag::EXTENDED_REQUEST => {
                let mut parts = Components::new(value, "ExtendedRequest")?;
                let name = parts
                    .next_if_context(0)
                    .ok_or_else(|| malformed("ExtendedRequest", "missing requestName"))
                    .and_then(|v| tagged_bytes(&v, "ExtendedRequest"))
                    .and_then(utf8)?;
                let value = parts
                    .next_if_context(1)
                    .map(|v| tagged_bytes(&v, "ExtendedRequest"))
                    .transpose()?;
                ProtocolOp::ExtendedRequest(ExtendedRequest { name, value })
            }
            op_tag::EXTENDED_RESPONSE => {
                let mut parts = Components::new(value, "ExtendedResponse")?;
                let result = LdapResult::read(&mut parts)?;
                let name = parts
                    .next_if_context(10)
                    .map(|v| tagged_bytes(&v, "ExtendedResponse").and_then(utf8))
                    .transpose()?;
                let value = parts
                    .next_if_context(11)
                    .map(|v| tagged_bytes(&v, "ExtendedResponse"))
                    .transpose()?;
                ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result,
                    name,
                    value,
                })
            }
            op_tag::INTERMEDIATE_RESPONSE => {
                let mut parts = Components::new(value, "IntermediateResponse")?;
                let name = parts
                    .next_if_context(0)
                    .map(|v| tagged_bytes(&v, "IntermediateResponse").and_then(utf8))
                    .transpose()?;
                let value = parts
                    .next_if_context(1)
                    .map(|v| tagged_bytes(&v, "IntermediateResponse"))
                    .transpose()?;
                ProtocolOp::IntermediateResponse(IntermediateResponse { name, value })
            }
            _ => return Err(malformed("protocolOp", "unknown operation tag")),
        };
        Ok(op)
    }
}

/// A complete `LDAPMessage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// Server-originated message not tied to a request
    pub fn is_unsolicited(&self) -> bool {
        self.message_id == 0
    }

    pub fn is_notice_of_disconnection(&self) -> bool {
        self.is_unsolicited()
            && matches!(
                &self.op,
                ProtocolOp::ExtendedResponse(ExtendedResponse { name: Some(name), .. })
                    if name == oids::NOTICE_OF_DISCONNECTION
            )
    }

    pub fn to_asn1(&self) -> Asn1Value {
        let mut items = vec![
            Asn1Value::Integer(i64::from(self.message_id)),
            self.op.to_asn1(),
        ];
        if !self.controls.is_empty() {
            items.push(Asn1Value::implicit(
                TagClass::Context,
                0,
                Asn1Value::Sequence(self.controls.iter().map(Control::to_asn1).collect()),
            ));
        }
        Asn1Value::Sequence(items)
    }

    pub fn from_asn1(value: Asn1Value) -> DecodeResult<Self> {
        if !matches!(value, Asn1Value::Sequence(_)) {
            return Err(malformed("LDAPMessage", "expected SEQUENCE"));
        }
        let mut parts = Components::new(value, "LDAPMessage")?;
        let message_id = message_id(parts.next_integer()?)?;
        let op = ProtocolOp::from_asn1(parts.next()?)?;
        let controls = match parts.next_if_context(0) {
            Some(v) => Components::new(v, "Controls")?
                .rest()
                .into_iter()
                .map(Control::from_asn1)
                .collect::<DecodeResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        if !parts.is_empty() {
            return Err(malformed("LDAPMessage", "unexpected trailing element"));
        }
        Ok(Self {
            message_id,
            op,
            controls,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        ber::encode(&self.to_asn1())
    }

    /// Decode a buffer holding exactly one message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = ber::decode_exact(bytes)?;
        Ok(Self::from_asn1(value)?)
    }
}

fn application(tag: u32, items: Vec<Asn1Value>) -> Asn1Value {
    Asn1Value::implicit(TagClass::Application, tag, Asn1Value::Sequence(items))
}

fn message_id(raw: i64) -> DecodeResult<i32> {
    i32::try_from(raw)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| malformed("LDAPMessage", "message ID out of range"))
}

fn limit(raw: i64, what: &'static str) -> DecodeResult<i32> {
    i32::try_from(raw)
        .ok()
        .filter(|v| *v >= 0)
        .ok_or_else(|| malformed("SearchRequest", what))
}

fn read_strings(value: Asn1Value, context: &'static str) -> DecodeResult<Vec<String>> {
    Components::new(value, context)?
        .rest()
        .into_iter()
        .map(|v| {
            v.into_bytes()
                .ok_or_else(|| malformed(context, "expected OCTET STRING"))
                .and_then(utf8)
        })
        .collect()
}

fn read_attributes(value: Asn1Value, context: &'static str) -> DecodeResult<Vec<PartialAttribute>> {
    Components::new(value, context)?
        .rest()
        .into_iter()
        .map(PartialAttribute::from_asn1)
        .collect()
}

fn read_modification(value: Asn1Value) -> DecodeResult<Modification> {
    let mut parts = Components::new(value, "Modification")?;
    let operation = match parts.next_enumerated()? {
        0 => ModifyOperation::Add,
        1 => ModifyOperation::Delete,
        2 => ModifyOperation::Replace,
        3 => ModifyOperation::Increment,
        _ => return Err(malformed("Modification", "unknown operation")),
    };
    let attribute = PartialAttribute::from_asn1(parts.next()?)?;
    Ok(Modification {
        operation,
        attribute,
    })
}
