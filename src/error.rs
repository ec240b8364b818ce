//! Result codes and error types shared by the codec, connections and the pool.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ldap_protocol::LdapResult;

/// LDAP result code (RFC 4511 section 4.1.9) plus the client-side codes 81..=91.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: ResultCode = ResultCode(7);
    pub const STRONG_AUTH_REQUIRED: ResultCode = ResultCode(8);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const ADMIN_LIMIT_EXCEEDED: ResultCode = ResultCode(11);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: ResultCode = ResultCode(12);
    pub const CONFIDENTIALITY_REQUIRED: ResultCode = ResultCode(13);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_ATTRIBUTE: ResultCode = ResultCode(16);
    pub const UNDEFINED_ATTRIBUTE_TYPE: ResultCode = ResultCode(17);
    pub const CONSTRAINT_VIOLATION: ResultCode = ResultCode(19);
    pub const ATTRIBUTE_OR_VALUE_EXISTS: ResultCode = ResultCode(20);
    pub const INVALID_ATTRIBUTE_SYNTAX: ResultCode = ResultCode(21);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_DN_SYNTAX: ResultCode = ResultCode(34);
    pub const INAPPROPRIATE_AUTHENTICATION: ResultCode = ResultCode(48);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: ResultCode = ResultCode(50);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const NAMING_VIOLATION: ResultCode = ResultCode(64);
    pub const OBJECT_CLASS_VIOLATION: ResultCode = ResultCode(65);
    pub const NOT_ALLOWED_ON_NON_LEAF: ResultCode = ResultCode(66);
    pub const ENTRY_ALREADY_EXISTS: ResultCode = ResultCode(68);
    pub const OTHER: ResultCode = ResultCode(80);
    pub const CLIENT_SIDE_SERVER_DOWN: ResultCode = ResultCode(81);
    pub const CLIENT_SIDE_LOCAL_ERROR: ResultCode = ResultCode(82);
    pub const CLIENT_SIDE_ENCODING_ERROR: ResultCode = ResultCode(83);
    pub const CLIENT_SIDE_DECODING_ERROR: ResultCode = ResultCode(84);
    pub const CLIENT_SIDE_TIMEOUT: ResultCode = ResultCode(85);
    pub const CLIENT_SIDE_FILTER_ERROR: ResultCode = ResultCode(87);
    pub const CLIENT_SIDE_USER_CANCELLED: ResultCode = ResultCode(88);
    pub const CLIENT_SIDE_PARAM_ERROR: ResultCode = ResultCode(89);
    pub const CLIENT_SIDE_CONNECT_ERROR: ResultCode = ResultCode(91);
    pub const CANCELED: ResultCode = ResultCode(118);
    pub const NO_SUCH_OPERATION: ResultCode = ResultCode(119);
    pub const TOO_LATE: ResultCode = ResultCode(120);
    pub const CANNOT_CANCEL: ResultCode = ResultCode(121);
    pub const NO_OPERATION: ResultCode = ResultCode(16654);

    /// True when a result carrying this code should complete its future as a failure.
    pub fn is_exceptional(self) -> bool {
        !matches!(
            self,
            Self::SUCCESS
                | Self::COMPARE_FALSE
                | Self::COMPARE_TRUE
                | Self::SASL_BIND_IN_PROGRESS
                | Self::NO_OPERATION
        )
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            11 => "adminLimitExceeded",
            12 => "unavailableCriticalExtension",
            13 => "confidentialityRequired",
            14 => "saslBindInProgress",
            16 => "noSuchAttribute",
            17 => "undefinedAttributeType",
            19 => "constraintViolation",
            20 => "attributeOrValueExists",
            21 => "invalidAttributeSyntax",
            32 => "noSuchObject",
            34 => "invalidDNSyntax",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            64 => "namingViolation",
            65 => "objectClassViolation",
            66 => "notAllowedOnNonLeaf",
            68 => "entryAlreadyExists",
            80 => "other",
            81 => "serverDown",
            82 => "localError",
            83 => "encodingError",
            84 => "decodingError",
            85 => "timeout",
            87 => "filterError",
            88 => "userCancelled",
            89 => "paramError",
            91 => "connectError",
            118 => "canceled",
            119 => "noSuchOperation",
            120 => "tooLate",
            121 => "cannotCancel",
            16654 => "noOperation",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Failure to decode BER or an LDAP message from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated BER element: missing type byte")]
    TruncatedType,
    #[error("truncated BER element: missing length bytes")]
    TruncatedLength,
    #[error("indefinite-length BER encoding is not supported")]
    IndefiniteLength,
    #[error("BER length uses {0} bytes, at most 4 are supported")]
    InvalidLengthBytes(usize),
    #[error("BER element length {length} exceeds the maximum of {max} bytes")]
    ElementTooLarge { length: usize, max: usize },
    #[error("invalid {kind} length: {length}")]
    InvalidLength { kind: &'static str, length: usize },
    #[error("truncated {kind} value: {length} bytes declared, {remaining} available")]
    TruncatedValue {
        kind: &'static str,
        length: usize,
        remaining: usize,
    },
    #[error("end of sequence requested but no sequence was started")]
    SequenceNotStarted,
    #[error("expected tag 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },
    #[error("unsupported LDAP message: message ID {message_id}, tag 0x{tag:02X}")]
    UnsupportedMessage { message_id: i32, tag: u8 },
    #[error("unexpected LDAP message: message ID {message_id}, {operation}")]
    UnexpectedMessage {
        message_id: i32,
        operation: &'static str,
    },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Error completing an LDAP operation or using a connection or pool.
#[derive(Debug, Clone, Error)]
pub enum LdapError {
    /// The server answered with a non-success result code.
    #[error("{0}")]
    Operation(LdapResult),
    #[error("decoding error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encoding error: {0}")]
    Encode(String),
    #[error("connection to the server was lost: {0}")]
    ServerDown(String),
    #[error("connect error: {0}")]
    Connect(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("a bind or StartTLS operation is in progress")]
    SecurityOperationInProgress,
    #[error("other operations are pending on this connection")]
    OperationsPending,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid filter: {0}")]
    Filter(String),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl LdapError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            LdapError::Operation(result) => result.result_code,
            LdapError::Decode(_) => ResultCode::CLIENT_SIDE_DECODING_ERROR,
            LdapError::Encode(_) => ResultCode::CLIENT_SIDE_ENCODING_ERROR,
            LdapError::ServerDown(_) | LdapError::ConnectionClosed => {
                ResultCode::CLIENT_SIDE_SERVER_DOWN
            }
            LdapError::Connect(_) => ResultCode::CLIENT_SIDE_CONNECT_ERROR,
            LdapError::SecurityOperationInProgress
            | LdapError::OperationsPending
            | LdapError::PoolClosed
            | LdapError::IllegalState(_) => ResultCode::CLIENT_SIDE_LOCAL_ERROR,
            LdapError::Cancelled => ResultCode::CLIENT_SIDE_USER_CANCELLED,
            LdapError::Timeout(_) => ResultCode::CLIENT_SIDE_TIMEOUT,
            LdapError::Filter(_) => ResultCode::CLIENT_SIDE_FILTER_ERROR,
        }
    }

    /// Best-effort LDAP result describing this error, as if the server had sent it.
    pub fn error_result(&self) -> LdapResult {
        match self {
            LdapError::Operation(result) => result.clone(),
            other => LdapResult::new(other.result_code()).with_diagnostic_message(other.to_string()),
        }
    }

    /// True for errors raised before any bytes were written.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            LdapError::ConnectionClosed
                | LdapError::SecurityOperationInProgress
                | LdapError::OperationsPending
                | LdapError::PoolClosed
                | LdapError::IllegalState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceptional_result_codes() {
        assert!(!ResultCode::SUCCESS.is_exceptional());
        assert!(!ResultCode::COMPARE_TRUE.is_exceptional());
        assert!(!ResultCode::COMPARE_FALSE.is_exceptional());
        assert!(!ResultCode::SASL_BIND_IN_PROGRESS.is_exceptional());
        assert!(ResultCode::INVALID_CREDENTIALS.is_exceptional());
        assert!(ResultCode::REFERRAL.is_exceptional());
        assert!(ResultCode::CLIENT_SIDE_SERVER_DOWN.is_exceptional());
    }

    #[test]
    fn test_result_code_display() {
        assert_eq!(ResultCode::NO_SUCH_OBJECT.to_string(), "32 (noSuchObject)");
        assert_eq!(ResultCode(999).to_string(), "999 (unknown)");
    }

    #[test]
    fn test_error_result_for_client_side_errors() {
        let result = LdapError::ServerDown("reset by peer".to_string()).error_result();
        assert_eq!(result.result_code, ResultCode::CLIENT_SIDE_SERVER_DOWN);
        assert!(result.diagnostic_message.contains("reset by peer"));

        let result = LdapError::Cancelled.error_result();
        assert_eq!(result.result_code, ResultCode::CLIENT_SIDE_USER_CANCELLED);

        let decode = LdapError::from(DecodeError::IndefiniteLength);
        assert_eq!(decode.result_code(), ResultCode::CLIENT_SIDE_DECODING_ERROR);
    }

    #[test]
    fn test_operation_error_keeps_server_result() {
        let server = LdapResult::new(ResultCode::INVALID_CREDENTIALS)
            .with_diagnostic_message("bad password");
        let err = LdapError::Operation(server.clone());
        assert_eq!(err.result_code(), ResultCode::INVALID_CREDENTIALS);
        assert_eq!(err.error_result(), server);
        assert!(!err.is_usage_error());
        assert!(LdapError::PoolClosed.is_usage_error());
    }
}
