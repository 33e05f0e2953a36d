//! The error taxonomy shared by every `sbm-core` component.
//!
//! Closely modeled on the generated error-kind pattern used elsewhere in this
//! codebase: a closed, numbered `CoreErrorKind` enum plus a `{kind, msg}`
//! struct that carries a free-form message for logs/debugging while keeping
//! the kind itself machine-matchable and stable across versions.

use std::fmt;

#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `ErrorCode` is the common serialized representation for [`CoreErrorKind`].
pub type ErrorCode = u16;

/// The set of methods and traits derived by the [`error_kind!`] macro.
pub trait ErrorKindGenerated:
    Copy
    + Clone
    + Default
    + Eq
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + From<ErrorCode>
    + Sized
    + 'static
{
    /// All known error kind variants, excluding `Unknown(_)`.
    const KINDS: &'static [Self];

    fn is_unknown(&self) -> bool;
    fn to_name(self) -> &'static str;
    fn to_msg(self) -> &'static str;
    fn to_code(self) -> ErrorCode;
    fn from_code(code: ErrorCode) -> Self;
}

/// This macro takes an error kind enum declaration and generates impls for
/// [`ErrorKindGenerated`] and its dependent traits.
///
/// All error kind types must have an `Unknown(ErrorCode)` variant listed
/// first, to preserve the error code of any variant this version of the
/// software doesn't recognize. Doc strings on each variant become both the
/// [`ErrorKindGenerated::to_msg`] output and the [`fmt::Display`] impl.
macro_rules! error_kind {
    {
        $(#[$enum_meta:meta])*
        pub enum $error_kind_name:ident {
            $( #[doc = $unknown_msg:literal] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg:literal] )*
                $item_name:ident = $item_code:literal
            ),*

            $(,)?
        }
    } => {
        $(#[$enum_meta])*
        pub enum $error_kind_name {
            $( #[doc = $unknown_msg] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg] )*
                $item_name
            ),*
        }

        impl ErrorKindGenerated for $error_kind_name {
            const KINDS: &'static [Self] = &[
                $( Self::$item_name, )*
            ];

            #[inline]
            fn is_unknown(&self) -> bool {
                matches!(self, Self::Unknown(_))
            }

            fn to_name(self) -> &'static str {
                match self {
                    $( Self::$item_name => stringify!($item_name), )*
                    Self::Unknown(_) => "Unknown",
                }
            }

            fn to_msg(self) -> &'static str {
                match self {
                    $( Self::$item_name => concat!($( $item_msg, )*), )*
                    Self::Unknown(_) => concat!($( $unknown_msg, )*),
                }
            }

            fn to_code(self) -> ErrorCode {
                match self {
                    $( Self::$item_name => $item_code, )*
                    Self::Unknown(code) => code,
                }
            }

            fn from_code(code: ErrorCode) -> Self {
                #[deny(unreachable_patterns)]
                match code {
                    0 => Self::Unknown(0),
                    $( $item_code => Self::$item_name, )*
                    _ => Self::Unknown(code),
                }
            }
        }

        impl Default for $error_kind_name {
            fn default() -> Self {
                Self::Unknown(0)
            }
        }

        impl fmt::Display for $error_kind_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = (*self).to_name();
                let msg = (*self).to_msg();
                let code = (*self).to_code();
                write!(f, "[{code}={name}]{msg}")
            }
        }

        impl From<ErrorCode> for $error_kind_name {
            #[inline]
            fn from(code: ErrorCode) -> Self {
                Self::from_code(code)
            }
        }

        impl From<$error_kind_name> for ErrorCode {
            #[inline]
            fn from(val: $error_kind_name) -> ErrorCode {
                val.to_code()
            }
        }

        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $error_kind_name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;

            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::arbitrary::any;
                use proptest::strategy::Strategy;
                use proptest::{prop_oneof, sample};

                prop_oneof![
                    9 => sample::select(Self::KINDS),
                    1 => any::<ErrorCode>().prop_map(Self::from_code),
                ].boxed()
            }
        }
    }
}

error_kind! {
    /// The closed taxonomy of errors `sbm-core` components can produce.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum CoreErrorKind {
        /// An error not recognized by this version of the software
        Unknown(ErrorCode),

        /// The requested entity does not exist
        NotFound = 1,
        /// The caller is not authorized to perform this action
        Unauthorized = 2,
        /// An invoice with this content hash already exists
        DuplicateHash = 3,
        /// An invoice closely resembling an existing one was flagged for review
        DuplicateSuspect = 4,
        /// The trip is bad-debt locked and can no longer be auto-assigned
        TripBadDebtLocked = 5,
        /// A payment is missing the transaction time required to match it
        MissingTransactionTime = 6,
        /// The attachment or link body could not be parsed into an invoice
        ParseError = 7,
        /// Fetching a remote resource failed after retries
        RemoteFetchFailed = 8,
        /// A provider-specific link could not be resolved to an invoice document
        ProviderResolveFailed = 9,
        /// The invite has already been used
        ConflictInviteUsed = 10,
        /// The invite has expired
        ConflictInviteExpired = 11,
        /// The invite is malformed or unknown
        ConflictInviteInvalid = 12,
    }
}

/// The common JSON-serialized representation for a [`CoreError`]. This is the
/// only error representation that crosses a collaborator boundary (e.g. the
/// out-of-scope HTTP layer); everything else converts to/from it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub msg: String,
}

/// The primary error type returned by `sbm-core` operations.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
#[error("{kind}: {msg}")]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub msg: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, msg: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, msg)
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ParseError, msg)
    }

    pub fn remote_fetch_failed(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::RemoteFetchFailed, msg)
    }

    pub fn provider_resolve_failed(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ProviderResolveFailed, msg)
    }
}

impl From<ErrorResponse> for CoreError {
    fn from(resp: ErrorResponse) -> Self {
        Self { kind: CoreErrorKind::from_code(resp.code), msg: resp.msg }
    }
}

impl From<CoreError> for ErrorResponse {
    fn from(err: CoreError) -> Self {
        Self { code: err.kind.to_code(), msg: err.msg }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_roundtrips_through_code() {
        for &kind in CoreErrorKind::KINDS {
            let code = kind.to_code();
            assert_eq!(CoreErrorKind::from_code(code), kind);
        }
    }

    #[test]
    fn unknown_code_round_trips() {
        let kind = CoreErrorKind::from_code(9999);
        assert!(kind.is_unknown());
        assert_eq!(kind.to_code(), 9999);
    }

    #[test]
    fn error_response_roundtrip() {
        let err = CoreError::not_found("invoice 123 not found");
        let resp = ErrorResponse::from(err.clone());
        let err2 = CoreError::from(resp);
        assert_eq!(err, err2);
    }
}
