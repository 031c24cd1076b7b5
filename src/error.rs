//! LDAP errors

use crate::ldap::ResultCode;
use asn1_rs::nom;
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::IResult;

/// Holds the result of parsing functions (LDAP)
///
/// Note that this type is also a `Result`, so usual functions (`map`, `unwrap` etc.) are available.
///
/// Note that this type is not named `LdapResult` to avoid conflicts with LDAP standard type
pub type Result<'a, T> = IResult<&'a [u8], T, LdapError>;

/// An error that can occur while parsing an LDAP message
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LdapError {
    #[error("Invalid LDAP String encoding")]
    InvalidString,

    #[error("Invalid LDAP Authentication Type")]
    InvalidAuthenticationType,

    #[error("Invalid DN encoding")]
    InvalidDN,

    #[error("Invalid Substring Type")]
    InvalidSubstring,

    #[error("Invalid Type for Filter")]
    InvalidFilterType,
    #[error("Invalid Type for Message")]
    InvalidMessageType,

    #[error("Unknown error")]
    Unknown,

    #[error("BER error: {0}")]
    Ber(#[from] asn1_rs::Error),
    #[error("nom error: {0:?}")]
    NomError(ErrorKind),
}

impl From<LdapError> for nom::Err<LdapError> {
    fn from(e: LdapError) -> nom::Err<LdapError> {
        nom::Err::Error(e)
    }
}

impl From<ErrorKind> for LdapError {
    fn from(e: ErrorKind) -> LdapError {
        LdapError::NomError(e)
    }
}

impl<I> ParseError<I> for LdapError {
    fn from_error_kind(_input: I, kind: ErrorKind) -> Self {
        LdapError::NomError(kind)
    }
    fn append(_input: I, kind: ErrorKind, _other: Self) -> Self {
        LdapError::NomError(kind)
    }
}

impl<I, E> FromExternalError<I, E> for LdapError {
    fn from_external_error(_input: I, kind: ErrorKind, _e: E) -> LdapError {
        LdapError::NomError(kind)
    }
}

/// A failed LDAP operation, carried back to the client as a result code plus
/// diagnostic message. Expected business failures are constructed directly;
/// store faults are wrapped as `OperationsError`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("operation failed ({code:?}): {message}")]
pub struct OperationError {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
}

impl OperationError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        OperationError {
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: impl Into<String>) -> Self {
        self.matched_dn = matched_dn.into();
        self
    }

    pub fn no_such_object(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NoSuchObject, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ResultCode::InvalidCredentials, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ProtocolError, message)
    }

    pub fn invalid_dn(message: impl Into<String>) -> Self {
        Self::new(ResultCode::InvalidDNSyntax, message)
    }

    pub fn unwilling(message: impl Into<String>) -> Self {
        Self::new(ResultCode::UnwillingToPerform, message)
    }
}

impl From<crate::store::StoreError> for OperationError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match e {
            StoreError::NoSuchEntry => Self::new(ResultCode::NoSuchObject, "no such object"),
            StoreError::AlreadyExists => {
                Self::new(ResultCode::EntryAlreadyExists, "entry already exists")
            }
            StoreError::NotLeaf => Self::new(
                ResultCode::NotAllowedOnNonLeaf,
                "subordinate entries exist",
            ),
            StoreError::AttributeOrValueExists => Self::new(
                ResultCode::AttributeOrValueExists,
                "attribute or value exists",
            ),
            StoreError::NoSuchAttribute => {
                Self::new(ResultCode::NoSuchAttribute, "no such attribute")
            }
            StoreError::MembershipCycle => Self::new(
                ResultCode::ConstraintViolation,
                "group membership would create a cycle",
            ),
            StoreError::Constraint(msg) => Self::new(ResultCode::ConstraintViolation, msg),
            StoreError::Backend(msg) => Self::new(ResultCode::OperationsError, msg),
        }
    }
}
