//! Extended operations: request builders for the well-known OIDs, and typed
//! decoding of extended results through a per-OID decoder registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ber::{BerReader, BerWriter, UNIVERSAL_SEQUENCE_TYPE};
use crate::error::{DecodeError, LdapError};
use crate::ldap_protocol::{DecodeOptions, ExtendedRequest, ExtendedResponse};

pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
pub const CANCEL_OID: &str = "1.3.6.1.1.8";
pub const GET_CONNECTION_ID_OID: &str = "1.3.6.1.4.1.26027.1.6.2";
/// Unsolicited notification sent by a server before it drops the connection.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

const PASSWORD_MODIFY_USER_IDENTITY: u8 = 0x80;
const PASSWORD_MODIFY_OLD_PASSWORD: u8 = 0x81;
const PASSWORD_MODIFY_NEW_PASSWORD: u8 = 0x82;
const PASSWORD_MODIFY_GENERATED_PASSWORD: u8 = 0x80;

impl ExtendedRequest {
    pub fn start_tls() -> Self {
        Self::new(START_TLS_OID, None)
    }

    pub fn who_am_i() -> Self {
        Self::new(WHO_AM_I_OID, None)
    }

    pub fn get_connection_id() -> Self {
        Self::new(GET_CONNECTION_ID_OID, None)
    }

    /// RFC 3909 cancel of the operation with `message_id`.
    pub fn cancel(message_id: i32) -> Result<Self, LdapError> {
        let mut writer = BerWriter::new();
        writer.write_start_sequence();
        writer.write_integer(message_id as i64);
        writer.write_end_sequence()?;
        Ok(Self::new(CANCEL_OID, Some(writer.into_vec()?)))
    }

    /// RFC 3062 password modify. Every field is optional; with no new password
    /// the server may generate one.
    pub fn password_modify(
        user_identity: Option<&str>,
        old_password: Option<&[u8]>,
        new_password: Option<&[u8]>,
    ) -> Result<Self, LdapError> {
        let mut writer = BerWriter::new();
        writer.write_start_sequence();
        if let Some(user) = user_identity {
            writer.write_octet_string_with_tag(PASSWORD_MODIFY_USER_IDENTITY, user.as_bytes());
        }
        if let Some(old) = old_password {
            writer.write_octet_string_with_tag(PASSWORD_MODIFY_OLD_PASSWORD, old);
        }
        if let Some(new) = new_password {
            writer.write_octet_string_with_tag(PASSWORD_MODIFY_NEW_PASSWORD, new);
        }
        writer.write_end_sequence()?;
        Ok(Self::new(PASSWORD_MODIFY_OID, Some(writer.into_vec()?)))
    }
}

/// Outcome of an extended operation, decoded according to the request OID.
#[derive(Clone)]
pub enum ExtendedResult {
    /// No decoder registered for the OID.
    Generic(ExtendedResponse),
    WhoAmI {
        response: ExtendedResponse,
        authz_id: String,
    },
    PasswordModify {
        response: ExtendedResponse,
        generated_password: Option<Vec<u8>>,
    },
    ConnectionId {
        response: ExtendedResponse,
        connection_id: i64,
    },
    /// Value produced by an application-registered decoder.
    Custom {
        response: ExtendedResponse,
        value: Arc<dyn Any + Send + Sync>,
    },
}

impl ExtendedResult {
    pub fn response(&self) -> &ExtendedResponse {
        match self {
            ExtendedResult::Generic(response)
            | ExtendedResult::WhoAmI { response, .. }
            | ExtendedResult::PasswordModify { response, .. }
            | ExtendedResult::ConnectionId { response, .. }
            | ExtendedResult::Custom { response, .. } => response,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            ExtendedResult::Custom { value, .. } => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for ExtendedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedResult::Generic(response) => f.debug_tuple("Generic").field(response).finish(),
            ExtendedResult::WhoAmI { response, authz_id } => f
                .debug_struct("WhoAmI")
                .field("response", response)
                .field("authz_id", authz_id)
                .finish(),
            ExtendedResult::PasswordModify {
                response,
                generated_password,
            } => f
                .debug_struct("PasswordModify")
                .field("response", response)
                .field("generated_password", &generated_password.as_ref().map(|_| "<redacted>"))
                .finish(),
            ExtendedResult::ConnectionId {
                response,
                connection_id,
            } => f
                .debug_struct("ConnectionId")
                .field("response", response)
                .field("connection_id", connection_id)
                .finish(),
            ExtendedResult::Custom { response, .. } => f
                .debug_struct("Custom")
                .field("response", response)
                .finish_non_exhaustive(),
        }
    }
}

/// Turns a successful raw extended response into a typed result.
pub trait ExtendedResultDecoder: Send + Sync {
    fn decode(&self, response: ExtendedResponse, options: &DecodeOptions) -> Result<ExtendedResult, DecodeError>;
}

impl<F> ExtendedResultDecoder for F
where
    F: Fn(ExtendedResponse, &DecodeOptions) -> Result<ExtendedResult, DecodeError> + Send + Sync,
{
    fn decode(&self, response: ExtendedResponse, options: &DecodeOptions) -> Result<ExtendedResult, DecodeError> {
        self(response, options)
    }
}

/// Decoders keyed by request OID. Built once and shared by every connection
/// a factory creates.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn ExtendedResultDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the WhoAmI, PasswordModify and GetConnectionID decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(WHO_AM_I_OID, decode_who_am_i);
        registry.register(PASSWORD_MODIFY_OID, decode_password_modify);
        registry.register(GET_CONNECTION_ID_OID, decode_connection_id);
        registry
    }

    pub fn register(&mut self, oid: impl Into<String>, decoder: impl ExtendedResultDecoder + 'static) {
        self.decoders.insert(oid.into(), Arc::new(decoder));
    }

    pub fn get(&self, oid: &str) -> Option<Arc<dyn ExtendedResultDecoder>> {
        self.decoders.get(oid).cloned()
    }

    /// Exceptional result codes fail with `LdapError::Operation` before any
    /// OID-specific decoding.
    pub fn decode(
        &self,
        request_oid: &str,
        response: ExtendedResponse,
        options: &DecodeOptions,
    ) -> Result<ExtendedResult, LdapError> {
        if response.result.result_code.is_exceptional() {
            return Err(LdapError::Operation(response.result));
        }
        match self.decoders.get(request_oid) {
            Some(decoder) => Ok(decoder.decode(response, options)?),
            None => Ok(ExtendedResult::Generic(response)),
        }
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut oids: Vec<&String> = self.decoders.keys().collect();
        oids.sort();
        f.debug_struct("DecoderRegistry").field("oids", &oids).finish()
    }
}

// The response value is the bare authzId string, absent for anonymous.
fn decode_who_am_i(response: ExtendedResponse, _options: &DecodeOptions) -> Result<ExtendedResult, DecodeError> {
    let authz_id = match &response.response_value {
        Some(value) => String::from_utf8(value.clone()).map_err(|_| DecodeError::InvalidUtf8("authzId"))?,
        None => String::new(),
    };
    Ok(ExtendedResult::WhoAmI { response, authz_id })
}

fn decode_password_modify(response: ExtendedResponse, options: &DecodeOptions) -> Result<ExtendedResult, DecodeError> {
    let mut generated_password = None;
    if let Some(value) = &response.response_value {
        let mut reader = BerReader::from_slice(value, options.max_element_size);
        if reader.peek_type()? != UNIVERSAL_SEQUENCE_TYPE {
            return Err(DecodeError::Malformed("password modify response value"));
        }
        reader.read_start_sequence()?;
        while reader.has_next_element() {
            if reader.peek_type()? == PASSWORD_MODIFY_GENERATED_PASSWORD {
                generated_password = Some(reader.read_octet_string()?);
            } else {
                reader.skip_element()?;
            }
        }
        reader.read_end_sequence()?;
    }
    Ok(ExtendedResult::PasswordModify {
        response,
        generated_password,
    })
}

fn decode_connection_id(response: ExtendedResponse, options: &DecodeOptions) -> Result<ExtendedResult, DecodeError> {
    let value = response
        .response_value
        .as_deref()
        .ok_or(DecodeError::Malformed("get connection ID response without a value"))?;
    let connection_id = BerReader::from_slice(value, options.max_element_size).read_integer()?;
    Ok(ExtendedResult::ConnectionId {
        response,
        connection_id,
    })
}
