//! Definitions for LDAP protocol types

use crate::filter::*;
use asn1_rs::ToStatic;
use rusticata_macros::newtype_enum;
use std::borrow::Cow;

/// OID of the StartTLS extended operation (RFC 4511 §4.14)
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct ProtocolOpTag(pub u32);

newtype_enum! {
impl display ProtocolOpTag {
    BindRequest = 0,
    BindResponse = 1,
    UnbindRequest = 2,
    SearchRequest = 3,
    SearchResultEntry = 4,
    SearchResultDone = 5,
    ModifyRequest = 6,
    ModifyResponse = 7,
    AddRequest = 8,
    AddResponse = 9,
    DelRequest = 10,
    DelResponse = 11,
    ModDnRequest = 12,
    ModDnResponse = 13,
    CompareRequest = 14,
    CompareResponse = 15,
    AbandonRequest = 16,
    SearchResultReference = 19,
    ExtendedRequest = 23,
    ExtendedResponse = 24,
    IntermediateResponse = 25,
}
}

#[derive(Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct ResultCode(pub u32);

newtype_enum! {
impl debug ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    // -- 9 reserved --
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    InappropriateMatching = 18,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    // -- 22-31 unused --
    NoSuchObject = 32,
    AliasProblem = 33,
    InvalidDNSyntax = 34,
    // -- 35 reserved for undefined isLeaf --
    AliasDereferencingProblem = 36,
    // -- 37-47 unused --
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    LoopDetect = 54,
    // -- 55-63 unused --
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRDN = 67,
    EntryAlreadyExists = 68,
    ObjectClassModsProhibited = 69,
    // -- 70 reserved for CLDAP --
    AffectsMultipleDSAs = 71,
    // -- 72-79 unused --
    Other = 80,
}
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct MessageID(pub u32);

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct SearchScope(pub u32);

newtype_enum! {
impl debug SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
    SubordinateSubtree = 3,
}
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct DerefAliases(pub u32);

newtype_enum! {
impl debug DerefAliases {
    NeverDerefAliases = 0,
    DerefInSearching = 1,
    DerefFindingBaseObj = 2,
    DerefAlways = 3,
}
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Operation(pub u32);

newtype_enum! {
impl debug Operation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdapString<'a>(pub Cow<'a, str>);

impl LdapString<'_> {
    pub fn into_static(self) -> LdapString<'static> {
        LdapString(Cow::Owned(self.0.into_owned()))
    }
}

impl ToStatic for LdapString<'_> {
    type Owned = LdapString<'static>;
    fn to_static(&self) -> Self::Owned {
        LdapString(Cow::Owned(self.0.to_string()))
    }
}

impl<'a> From<&'a str> for LdapString<'a> {
    fn from(s: &'a str) -> Self {
        LdapString(Cow::Borrowed(s))
    }
}

impl From<String> for LdapString<'static> {
    fn from(s: String) -> Self {
        LdapString(Cow::Owned(s))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdapDN<'a>(pub Cow<'a, str>);

impl LdapDN<'_> {
    pub fn into_static(self) -> LdapDN<'static> {
        LdapDN(Cow::Owned(self.0.into_owned()))
    }
}

impl From<String> for LdapDN<'static> {
    fn from(s: String) -> Self {
        LdapDN(Cow::Owned(s))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelativeLdapDN<'a>(pub Cow<'a, str>);

impl RelativeLdapDN<'_> {
    pub fn into_static(self) -> RelativeLdapDN<'static> {
        RelativeLdapDN(Cow::Owned(self.0.into_owned()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdapOID<'a>(pub Cow<'a, str>);

impl LdapOID<'_> {
    pub fn into_static(self) -> LdapOID<'static> {
        LdapOID(Cow::Owned(self.0.into_owned()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdapResult<'a> {
    pub result_code: ResultCode,
    pub matched_dn: LdapDN<'a>,
    pub diagnostic_message: LdapString<'a>,
    // referral           [3] Referral OPTIONAL
}

impl LdapResult<'static> {
    pub fn new(
        result_code: ResultCode,
        matched_dn: impl Into<String>,
        diagnostic_message: impl Into<String>,
    ) -> Self {
        LdapResult {
            result_code,
            matched_dn: LdapDN(Cow::Owned(matched_dn.into())),
            diagnostic_message: LdapString(Cow::Owned(diagnostic_message.into())),
        }
    }

    pub fn success(matched_dn: impl Into<String>) -> Self {
        Self::new(ResultCode::Success, matched_dn, "")
    }
}

impl LdapResult<'_> {
    pub fn into_static(self) -> LdapResult<'static> {
        LdapResult {
            result_code: self.result_code,
            matched_dn: self.matched_dn.into_static(),
            diagnostic_message: self.diagnostic_message.into_static(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindRequest<'a> {
    pub version: u8,
    pub name: LdapDN<'a>,
    pub authentication: AuthenticationChoice<'a>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SaslCredentials<'a> {
    pub mechanism: LdapString<'a>,
    pub credentials: Option<Cow<'a, [u8]>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthenticationChoice<'a> {
    Simple(Cow<'a, [u8]>),
    Sasl(SaslCredentials<'a>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindResponse<'a> {
    pub result: LdapResult<'a>,
    pub server_sasl_creds: Option<Cow<'a, [u8]>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchRequest<'a> {
    pub base_object: LdapDN<'a>,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter<'a>,
    pub attributes: Vec<LdapString<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchResultEntry<'a> {
    pub object_name: LdapDN<'a>,
    pub attributes: Vec<PartialAttribute<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModifyRequest<'a> {
    pub object: LdapDN<'a>,
    pub changes: Vec<Change<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModifyResponse<'a> {
    pub result: LdapResult<'a>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change<'a> {
    pub operation: Operation,
    pub modification: PartialAttribute<'a>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddRequest<'a> {
    pub entry: LdapDN<'a>,
    pub attributes: Vec<Attribute<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModDnRequest<'a> {
    pub entry: LdapDN<'a>,
    pub newrdn: RelativeLdapDN<'a>,
    pub deleteoldrdn: bool,
    pub newsuperior: Option<LdapDN<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompareRequest<'a> {
    pub entry: LdapDN<'a>,
    pub ava: AttributeValueAssertion<'a>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendedRequest<'a> {
    pub request_name: LdapOID<'a>,
    pub request_value: Option<Cow<'a, [u8]>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendedResponse<'a> {
    pub result: LdapResult<'a>,
    pub response_name: Option<LdapOID<'a>>,
    pub response_value: Option<Cow<'a, [u8]>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntermediateResponse<'a> {
    pub response_name: Option<LdapOID<'a>>,
    pub response_value: Option<Cow<'a, [u8]>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolOp<'a> {
    BindRequest(BindRequest<'a>),
    BindResponse(BindResponse<'a>),
    UnbindRequest,
    SearchRequest(SearchRequest<'a>),
    SearchResultEntry(SearchResultEntry<'a>),
    SearchResultDone(LdapResult<'a>),
    SearchResultReference(Vec<LdapString<'a>>),
    ModifyRequest(ModifyRequest<'a>),
    ModifyResponse(ModifyResponse<'a>),
    AddRequest(AddRequest<'a>),
    AddResponse(LdapResult<'a>),
    DelRequest(LdapDN<'a>),
    DelResponse(LdapResult<'a>),
    ModDnRequest(ModDnRequest<'a>),
    ModDnResponse(LdapResult<'a>),
    CompareRequest(CompareRequest<'a>),
    CompareResponse(LdapResult<'a>),
    //
    AbandonRequest(MessageID),
    ExtendedRequest(ExtendedRequest<'a>),
    ExtendedResponse(ExtendedResponse<'a>),
    IntermediateResponse(IntermediateResponse<'a>),
}

impl ProtocolOp<'_> {
    /// Get tag number associated with the operation
    pub fn tag(&self) -> ProtocolOpTag {
        let op = match self {
            ProtocolOp::BindRequest(_) => 0,
            ProtocolOp::BindResponse(_) => 1,
            ProtocolOp::UnbindRequest => 2,
            ProtocolOp::SearchRequest(_) => 3,
            ProtocolOp::SearchResultEntry(_) => 4,
            ProtocolOp::SearchResultDone(_) => 5,
            ProtocolOp::ModifyRequest(_) => 6,
            ProtocolOp::ModifyResponse(_) => 7,
            ProtocolOp::AddRequest(_) => 8,
            ProtocolOp::AddResponse(_) => 9,
            ProtocolOp::DelRequest(_) => 10,
            ProtocolOp::DelResponse(_) => 11,
            ProtocolOp::ModDnRequest(_) => 12,
            ProtocolOp::ModDnResponse(_) => 13,
            ProtocolOp::CompareRequest(_) => 14,
            ProtocolOp::CompareResponse(_) => 15,
            ProtocolOp::AbandonRequest(_) => 16,
            ProtocolOp::SearchResultReference(_) => 19,
            ProtocolOp::ExtendedRequest(_) => 23,
            ProtocolOp::ExtendedResponse(_) => 24,
            ProtocolOp::IntermediateResponse(_) => 25,
        };
        ProtocolOpTag(op)
    }

    /// Get the LDAP result, if present
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ModifyResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(ref r)
            | ProtocolOp::AddResponse(ref r)
            | ProtocolOp::DelResponse(ref r)
            | ProtocolOp::ModDnResponse(ref r)
            | ProtocolOp::CompareResponse(ref r) => Some(r),
            _ => None,
        }
    }

    pub fn into_static(self) -> ProtocolOp<'static> {
        fn cow_bytes(c: Cow<'_, [u8]>) -> Cow<'static, [u8]> {
            Cow::Owned(c.into_owned())
        }
        match self {
            ProtocolOp::BindRequest(r) => ProtocolOp::BindRequest(BindRequest {
                version: r.version,
                name: r.name.into_static(),
                authentication: match r.authentication {
                    AuthenticationChoice::Simple(c) => AuthenticationChoice::Simple(cow_bytes(c)),
                    AuthenticationChoice::Sasl(s) => AuthenticationChoice::Sasl(SaslCredentials {
                        mechanism: s.mechanism.into_static(),
                        credentials: s.credentials.map(cow_bytes),
                    }),
                },
            }),
            ProtocolOp::BindResponse(r) => ProtocolOp::BindResponse(BindResponse {
                result: r.result.into_static(),
                server_sasl_creds: r.server_sasl_creds.map(cow_bytes),
            }),
            ProtocolOp::UnbindRequest => ProtocolOp::UnbindRequest,
            ProtocolOp::SearchRequest(r) => ProtocolOp::SearchRequest(SearchRequest {
                base_object: r.base_object.into_static(),
                scope: r.scope,
                deref_aliases: r.deref_aliases,
                size_limit: r.size_limit,
                time_limit: r.time_limit,
                types_only: r.types_only,
                filter: r.filter.to_static(),
                attributes: r
                    .attributes
                    .into_iter()
                    .map(LdapString::into_static)
                    .collect(),
            }),
            ProtocolOp::SearchResultEntry(r) => ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: r.object_name.into_static(),
                attributes: r.attributes.iter().map(|a| a.to_static()).collect(),
            }),
            ProtocolOp::SearchResultDone(r) => ProtocolOp::SearchResultDone(r.into_static()),
            ProtocolOp::SearchResultReference(v) => ProtocolOp::SearchResultReference(
                v.into_iter().map(LdapString::into_static).collect(),
            ),
            ProtocolOp::ModifyRequest(r) => ProtocolOp::ModifyRequest(ModifyRequest {
                object: r.object.into_static(),
                changes: r
                    .changes
                    .into_iter()
                    .map(|c| Change {
                        operation: c.operation,
                        modification: c.modification.to_static(),
                    })
                    .collect(),
            }),
            ProtocolOp::ModifyResponse(r) => ProtocolOp::ModifyResponse(ModifyResponse {
                result: r.result.into_static(),
            }),
            ProtocolOp::AddRequest(r) => ProtocolOp::AddRequest(AddRequest {
                entry: r.entry.into_static(),
                attributes: r.attributes.iter().map(|a| a.to_static()).collect(),
            }),
            ProtocolOp::AddResponse(r) => ProtocolOp::AddResponse(r.into_static()),
            ProtocolOp::DelRequest(dn) => ProtocolOp::DelRequest(dn.into_static()),
            ProtocolOp::DelResponse(r) => ProtocolOp::DelResponse(r.into_static()),
            ProtocolOp::ModDnRequest(r) => ProtocolOp::ModDnRequest(ModDnRequest {
                entry: r.entry.into_static(),
                newrdn: r.newrdn.into_static(),
                deleteoldrdn: r.deleteoldrdn,
                newsuperior: r.newsuperior.map(LdapDN::into_static),
            }),
            ProtocolOp::ModDnResponse(r) => ProtocolOp::ModDnResponse(r.into_static()),
            ProtocolOp::CompareRequest(r) => ProtocolOp::CompareRequest(CompareRequest {
                entry: r.entry.into_static(),
                ava: r.ava.to_static(),
            }),
            ProtocolOp::CompareResponse(r) => ProtocolOp::CompareResponse(r.into_static()),
            ProtocolOp::AbandonRequest(id) => ProtocolOp::AbandonRequest(id),
            ProtocolOp::ExtendedRequest(r) => ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: r.request_name.into_static(),
                request_value: r.request_value.map(cow_bytes),
            }),
            ProtocolOp::ExtendedResponse(r) => ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: r.result.into_static(),
                response_name: r.response_name.map(LdapOID::into_static),
                response_value: r.response_value.map(cow_bytes),
            }),
            ProtocolOp::IntermediateResponse(r) => {
                ProtocolOp::IntermediateResponse(IntermediateResponse {
                    response_name: r.response_name.map(LdapOID::into_static),
                    response_value: r.response_value.map(cow_bytes),
                })
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Control<'a> {
    pub control_type: LdapOID<'a>,
    pub criticality: bool,
    pub control_value: Option<Cow<'a, [u8]>>,
}

impl Control<'_> {
    pub fn into_static(self) -> Control<'static> {
        Control {
            control_type: self.control_type.into_static(),
            criticality: self.criticality,
            control_value: self.control_value.map(|c| Cow::Owned(c.into_owned())),
        }
    }
}

/// An LDAP Message according to RFC4511
///
// LDAPMessage ::= SEQUENCE {
//      messageID       MessageID,
//      protocolOp      CHOICE { ... },
//      controls       [0] Controls OPTIONAL }
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LdapMessage<'a> {
    /// Message Identifier (32-bits unsigned integer)
    ///
    /// The messageID of a request MUST have a non-zero value different from the messageID of any
    /// other request in progress in the same LDAP session.  The zero value is reserved for the
    /// unsolicited notification message.
    pub message_id: MessageID,
    /// The LDAP operation from this LDAP message
    pub protocol_op: ProtocolOp<'a>,
    /// Message controls (optional)
    ///
    /// Controls provide a mechanism whereby the semantics and arguments of existing LDAP
    /// operations may be extended.  One or more controls may be attached to a single LDAP message.
    /// A control only affects the semantics of the message it is attached to.
    pub controls: Option<Vec<Control<'a>>>,
}

impl LdapMessage<'_> {
    /// Promote a message parsed out of a frame buffer to `'static` so it can
    /// cross task boundaries in the request pipeline.
    pub fn into_static(self) -> LdapMessage<'static> {
        LdapMessage {
            message_id: self.message_id,
            protocol_op: self.protocol_op.into_static(),
            controls: self
                .controls
                .map(|v| v.into_iter().map(Control::into_static).collect()),
        }
    }
}

impl LdapMessage<'static> {
    /// Build a response message for the given request id
    pub fn response(message_id: MessageID, protocol_op: ProtocolOp<'static>) -> Self {
        LdapMessage {
            message_id,
            protocol_op,
            controls: None,
        }
    }
}
