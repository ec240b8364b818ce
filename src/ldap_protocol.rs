// LDAP protocol messages and their BER encoding (RFC 4511 section 4).
// One LDAPMessage envelope per top-level SEQUENCE; the protocol operation is
// chosen by its APPLICATION tag.

use std::fmt;

use crate::ber::{BerReader, BerWriter, UNIVERSAL_BOOLEAN_TYPE, UNIVERSAL_OCTET_STRING_TYPE, UNIVERSAL_SEQUENCE_TYPE};
use crate::error::{DecodeError, LdapError, ResultCode};
use crate::filter::Filter;

pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 8 * 1024 * 1024;

/// Limits applied while decoding inbound messages and extended results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Largest accepted BER element length; 0 disables the check.
    pub max_element_size: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
        }
    }
}

// LDAP Control (request or response)
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
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(SearchResultReference),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind request",
            ProtocolOp::BindResponse(_) => "bind response",
            ProtocolOp::UnbindRequest => "unbind request",
            ProtocolOp::SearchRequest(_) => "search request",
            ProtocolOp::SearchResultEntry(_) => "search result entry",
            ProtocolOp::SearchResultReference(_) => "search result reference",
            ProtocolOp::SearchResultDone(_) => "search result done",
            ProtocolOp::ModifyRequest(_) => "modify request",
            ProtocolOp::ModifyResponse(_) => "modify response",
            ProtocolOp::AddRequest(_) => "add request",
            ProtocolOp::AddResponse(_) => "add response",
            ProtocolOp::DelRequest(_) => "delete request",
            ProtocolOp::DelResponse(_) => "delete response",
            ProtocolOp::ModifyDNRequest(_) => "modify DN request",
            ProtocolOp::ModifyDNResponse(_) => "modify DN response",
            ProtocolOp::CompareRequest(_) => "compare request",
            ProtocolOp::CompareResponse(_) => "compare response",
            ProtocolOp::AbandonRequest(_) => "abandon request",
            ProtocolOp::ExtendedRequest(_) => "extended request",
            ProtocolOp::ExtendedResponse(_) => "extended response",
            ProtocolOp::IntermediateResponse(_) => "intermediate response",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindRequest(_)
                | ProtocolOp::UnbindRequest
                | ProtocolOp::SearchRequest(_)
                | ProtocolOp::ModifyRequest(_)
                | ProtocolOp::AddRequest(_)
                | ProtocolOp::DelRequest(_)
                | ProtocolOp::ModifyDNRequest(_)
                | ProtocolOp::CompareRequest(_)
                | ProtocolOp::AbandonRequest(_)
                | ProtocolOp::ExtendedRequest(_)
        )
    }
}

/// LDAPResult components shared by every final response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
    /// Controls of the enclosing response message. Not part of the LDAPResult encoding.
    pub controls: Vec<Control>,
}

impl LdapResult {
    pub fn new(result_code: ResultCode) -> Self {
        Self {
            result_code,
            ..Self::default()
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS)
    }

    pub fn with_diagnostic_message(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = message.into();
        self
    }

    pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
        self.matched_dn = dn.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::SUCCESS
    }

    /// Ok for non-exceptional result codes, `LdapError::Operation` otherwise.
    pub fn into_result(self) -> Result<Self, LdapError> {
        if self.result_code.is_exceptional() {
            Err(LdapError::Operation(self))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "result code {}", self.result_code)?;
        if !self.diagnostic_message.is_empty() {
            write!(f, ": {}", self.diagnostic_message)?;
        }
        if !self.matched_dn.is_empty() {
            write!(f, " (matched DN: {})", self.matched_dn)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    pub fn sasl(name: impl Into<String>, mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_object: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_object: base_object.into(),
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

    pub fn with_size_limit(mut self, size_limit: i32) -> Self {
        self.size_limit = size_limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
    Subordinates = 3,
}

impl TryFrom<i32> for SearchScope {
    type Error = DecodeError;
    fn try_from(value: i32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            3 => Ok(SearchScope::Subordinates),
            _ => Err(DecodeError::InvalidValue {
                field: "search scope",
                value: value as i64,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<i32> for DerefAliases {
    type Error = DecodeError;
    fn try_from(value: i32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(DecodeError::InvalidValue {
                field: "deref aliases",
                value: value as i64,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    /// Attribute by case-insensitive type name.
    pub fn attribute(&self, attr_type: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.attr_type.eq_ignore_ascii_case(attr_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultReference {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl TryFrom<i32> for ModifyOperation {
    type Error = DecodeError;
    fn try_from(value: i32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            3 => Ok(ModifyOperation::Increment),
            _ => Err(DecodeError::InvalidValue {
                field: "modify operation",
                value: value as i64,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(request_name: impl Into<String>, request_value: Option<Vec<u8>>) -> Self {
        Self {
            request_name: request_name.into(),
            request_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<I, V>(attr_type: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self {
            attr_type: attr_type.into(),
            attr_values: values.into_iter().map(Into::into).collect(),
        }
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [APPLICATION 25] intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
const TAG_REFERRAL: u8 = 0xA3;
const TAG_AUTH_SIMPLE: u8 = 0x80;
const TAG_AUTH_SASL: u8 = 0xA3;
const TAG_SERVER_SASL_CREDS: u8 = 0x87;
const TAG_NEW_SUPERIOR: u8 = 0x80;
const TAG_EXTENDED_REQUEST_NAME: u8 = 0x80;
const TAG_EXTENDED_REQUEST_VALUE: u8 = 0x81;
const TAG_EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const TAG_EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
const TAG_INTERMEDIATE_NAME: u8 = 0x80;
const TAG_INTERMEDIATE_VALUE: u8 = 0x81;

/// Decode one complete LDAPMessage from a fully buffered top-level element.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage, DecodeError> {
    let mut reader = BerReader::from_slice(data, 0);
    decode_ldap_message(&mut reader)
}

/// Decode the next LDAPMessage. Callers that stream should check
/// `element_available()` first; the message is then read without blocking.
pub fn decode_ldap_message(reader: &mut BerReader) -> Result<LdapMessage, DecodeError> {
    let tag = reader.peek_type()?;
    if tag != UNIVERSAL_SEQUENCE_TYPE {
        return Err(DecodeError::UnexpectedTag {
            expected: UNIVERSAL_SEQUENCE_TYPE,
            actual: tag,
        });
    }
    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    reader.read_start_sequence()?;
    let raw_id = reader.read_integer()?;
    let message_id = i32::try_from(raw_id)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or(DecodeError::InvalidValue {
            field: "message ID",
            value: raw_id,
        })?;

    let op_tag = reader.peek_type()?;
    let protocol_op = match op_tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(decode_bind_request(reader)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(decode_bind_response(reader)?),
        LDAP_TAG_UNBIND_REQUEST => {
            reader.read_null()?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(decode_search_request(reader)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(decode_search_result_entry(reader)?),
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            ProtocolOp::SearchResultReference(decode_search_result_reference(reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(decode_ldap_result(reader)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(decode_modify_request(reader)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(decode_ldap_result(reader)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(decode_add_request(reader)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(decode_ldap_result(reader)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: reader.read_octet_string_utf8()?,
        }),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(decode_ldap_result(reader)?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(decode_modify_dn_request(reader)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(decode_ldap_result(reader)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(decode_compare_request(reader)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(decode_ldap_result(reader)?),
        LDAP_TAG_ABANDON_REQUEST => {
            let id = reader.read_integer()?;
            ProtocolOp::AbandonRequest(i32::try_from(id).map_err(|_| DecodeError::InvalidValue {
                field: "abandon message ID",
                value: id,
            })?)
        }
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(decode_extended_request(reader)?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(decode_extended_response(reader)?),
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(decode_intermediate_response(reader)?)
        }
        _ => return Err(DecodeError::UnsupportedMessage { message_id, tag: op_tag }),
    };

    let controls = if reader.has_next_element() && reader.peek_type()? == LDAP_CONTEXT_CONTROLS {
        decode_controls(reader)?
    } else {
        Vec::new()
    };
    reader.read_end_sequence()?;

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn decode_controls(reader: &mut BerReader) -> Result<Vec<Control>, DecodeError> {
    reader.read_start_sequence()?;
    let mut controls = Vec::new();
    while reader.has_next_element() {
        reader.read_start_sequence()?;
        let oid = reader.read_octet_string_utf8()?;
        let critical = if reader.has_next_element() && reader.peek_type()? == UNIVERSAL_BOOLEAN_TYPE {
            reader.read_boolean()?
        } else {
            false
        };
        let value = if reader.has_next_element() && reader.peek_type()? == UNIVERSAL_OCTET_STRING_TYPE {
            Some(reader.read_octet_string()?)
        } else {
            None
        };
        reader.read_end_sequence()?;
        controls.push(Control { oid, critical, value });
    }
    reader.read_end_sequence()?;
    Ok(controls)
}

fn read_lossy_string(reader: &mut BerReader) -> Result<String, DecodeError> {
    Ok(String::from_utf8_lossy(&reader.read_octet_string()?).into_owned())
}

/// resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL
fn decode_result_components(reader: &mut BerReader) -> Result<LdapResult, DecodeError> {
    let result_code = ResultCode(reader.read_enumerated()?);
    let matched_dn = read_lossy_string(reader)?;
    let diagnostic_message = read_lossy_string(reader)?;
    let mut referrals = Vec::new();
    if reader.has_next_element() && reader.peek_type()? == TAG_REFERRAL {
        reader.read_start_sequence()?;
        while reader.has_next_element() {
            referrals.push(reader.read_octet_string_utf8()?);
        }
        reader.read_end_sequence()?;
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
        controls: Vec::new(),
    })
}

fn decode_ldap_result(reader: &mut BerReader) -> Result<LdapResult, DecodeError> {
    reader.read_start_sequence()?;
    let result = decode_result_components(reader)?;
    reader.read_end_sequence()?;
    Ok(result)
}

fn decode_bind_request(reader: &mut BerReader) -> Result<BindRequest, DecodeError> {
    reader.read_start_sequence()?;
    let version = reader.read_integer()? as i32;
    let name = reader.read_octet_string_utf8()?;

    let authentication = match reader.peek_type()? {
        TAG_AUTH_SASL => {
            reader.read_start_sequence()?;
            let mechanism = reader.read_octet_string_utf8()?;
            let credentials = if reader.has_next_element() {
                Some(reader.read_octet_string()?)
            } else {
                None
            };
            reader.read_end_sequence()?;
            BindAuthentication::Sasl { mechanism, credentials }
        }
        TAG_AUTH_SIMPLE => BindAuthentication::Simple(reader.read_octet_string_utf8()?),
        other => {
            return Err(DecodeError::UnexpectedTag {
                expected: TAG_AUTH_SIMPLE,
                actual: other,
            })
        }
    };
    reader.read_end_sequence()?;

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn decode_bind_response(reader: &mut BerReader) -> Result<BindResponse, DecodeError> {
    reader.read_start_sequence()?;
    let result = decode_result_components(reader)?;
    let server_sasl_creds = if reader.has_next_element() && reader.peek_type()? == TAG_SERVER_SASL_CREDS {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    reader.read_end_sequence()?;
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn decode_search_request(reader: &mut BerReader) -> Result<SearchRequest, DecodeError> {
    reader.read_start_sequence()?;
    let base_object = reader.read_octet_string_utf8()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = DerefAliases::try_from(reader.read_enumerated()?)?;
    let size_limit = reader.read_integer()? as i32;
    let time_limit = reader.read_integer()? as i32;
    let types_only = reader.read_boolean()?;
    let filter = Filter::decode(reader)?;

    reader.read_start_sequence()?;
    let mut attributes = Vec::new();
    while reader.has_next_element() {
        attributes.push(reader.read_octet_string_utf8()?);
    }
    reader.read_end_sequence()?;
    reader.read_end_sequence()?;

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn decode_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry, DecodeError> {
    reader.read_start_sequence()?;
    let object_name = reader.read_octet_string_utf8()?;
    let attributes = decode_attribute_list(reader)?;
    reader.read_end_sequence()?;
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn decode_search_result_reference(reader: &mut BerReader) -> Result<SearchResultReference, DecodeError> {
    reader.read_start_sequence()?;
    let mut uris = Vec::new();
    while reader.has_next_element() {
        uris.push(reader.read_octet_string_utf8()?);
    }
    reader.read_end_sequence()?;
    Ok(SearchResultReference { uris })
}

fn decode_modify_request(reader: &mut BerReader) -> Result<ModifyRequest, DecodeError> {
    reader.read_start_sequence()?;
    let object = reader.read_octet_string_utf8()?;
    reader.read_start_sequence()?;
    let mut changes = Vec::new();
    while reader.has_next_element() {
        reader.read_start_sequence()?;
        let operation = ModifyOperation::try_from(reader.read_enumerated()?)?;
        let modification = decode_attribute(reader)?;
        reader.read_end_sequence()?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    reader.read_end_sequence()?;
    reader.read_end_sequence()?;
    Ok(ModifyRequest { object, changes })
}

fn decode_add_request(reader: &mut BerReader) -> Result<AddRequest, DecodeError> {
    reader.read_start_sequence()?;
    let entry = reader.read_octet_string_utf8()?;
    let attributes = decode_attribute_list(reader)?;
    reader.read_end_sequence()?;
    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn decode_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest, DecodeError> {
    reader.read_start_sequence()?;
    let entry = reader.read_octet_string_utf8()?;
    let newrdn = reader.read_octet_string_utf8()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.has_next_element() {
        let tag = reader.peek_type()?;
        if tag != TAG_NEW_SUPERIOR {
            return Err(DecodeError::UnexpectedTag {
                expected: TAG_NEW_SUPERIOR,
                actual: tag,
            });
        }
        Some(reader.read_octet_string_utf8()?)
    } else {
        None
    };
    reader.read_end_sequence()?;
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn decode_compare_request(reader: &mut BerReader) -> Result<CompareRequest, DecodeError> {
    reader.read_start_sequence()?;
    let entry = reader.read_octet_string_utf8()?;
    reader.read_start_sequence()?;
    let attr = reader.read_octet_string_utf8()?;
    let assertion_value = reader.read_octet_string()?;
    reader.read_end_sequence()?;
    reader.read_end_sequence()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

fn decode_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest, DecodeError> {
    reader.read_start_sequence()?;
    let request_name = reader.read_octet_string_utf8()?;
    let request_value = if reader.has_next_element() && reader.peek_type()? == TAG_EXTENDED_REQUEST_VALUE {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    reader.read_end_sequence()?;
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn decode_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse, DecodeError> {
    reader.read_start_sequence()?;
    let result = decode_result_components(reader)?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.has_next_element() {
        match reader.peek_type()? {
            TAG_EXTENDED_RESPONSE_NAME => response_name = Some(reader.read_octet_string_utf8()?),
            TAG_EXTENDED_RESPONSE_VALUE => response_value = Some(reader.read_octet_string()?),
            _ => reader.skip_element()?,
        }
    }
    reader.read_end_sequence()?;
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn decode_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse, DecodeError> {
    reader.read_start_sequence()?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.has_next_element() {
        match reader.peek_type()? {
            TAG_INTERMEDIATE_NAME => response_name = Some(reader.read_octet_string_utf8()?),
            TAG_INTERMEDIATE_VALUE => response_value = Some(reader.read_octet_string()?),
            _ => reader.skip_element()?,
        }
    }
    reader.read_end_sequence()?;
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

fn decode_attribute_list(reader: &mut BerReader) -> Result<Vec<Attribute>, DecodeError> {
    reader.read_start_sequence()?;
    let mut attributes = Vec::new();
    while reader.has_next_element() {
        attributes.push(decode_attribute(reader)?);
    }
    reader.read_end_sequence()?;
    Ok(attributes)
}

fn decode_attribute(reader: &mut BerReader) -> Result<Attribute, DecodeError> {
    reader.read_start_sequence()?;
    let attr_type = reader.read_octet_string_utf8()?;
    reader.read_start_set()?;
    let mut attr_values = Vec::new();
    while reader.has_next_element() {
        attr_values.push(reader.read_octet_string()?);
    }
    reader.read_end_set()?;
    reader.read_end_sequence()?;
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>, LdapError> {
    let mut writer = BerWriter::new();
    writer.write_start_sequence();
    writer.write_integer(message.message_id as i64);
    encode_protocol_op(&mut writer, &message.protocol_op)?;
    if !message.controls.is_empty() {
        encode_controls(&mut writer, &message.controls)?;
    }
    writer.write_end_sequence()?;
    writer.into_vec()
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) -> Result<(), LdapError> {
    writer.write_start_sequence_with_tag(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        writer.write_start_sequence();
        writer.write_string(&control.oid);
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(value) = &control.value {
            writer.write_octet_string(value);
        }
        writer.write_end_sequence()?;
    }
    writer.write_end_sequence()
}

fn encode_protocol_op(writer: &mut BerWriter, op: &ProtocolOp) -> Result<(), LdapError> {
    match op {
        ProtocolOp::BindRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_BIND_REQUEST);
            writer.write_integer(req.version as i64);
            writer.write_string(&req.name);
            match &req.authentication {
                BindAuthentication::Simple(password) => {
                    writer.write_octet_string_with_tag(TAG_AUTH_SIMPLE, password.as_bytes())
                }
                BindAuthentication::Sasl { mechanism, credentials } => {
                    writer.write_start_sequence_with_tag(TAG_AUTH_SASL);
                    writer.write_string(mechanism);
                    if let Some(credentials) = credentials {
                        writer.write_octet_string(credentials);
                    }
                    writer.write_end_sequence()?;
                }
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::BindResponse(resp) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_BIND_RESPONSE);
            encode_result_components(writer, &resp.result)?;
            if let Some(creds) = &resp.server_sasl_creds {
                writer.write_octet_string_with_tag(TAG_SERVER_SASL_CREDS, creds);
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::UnbindRequest => writer.write_null_with_tag(LDAP_TAG_UNBIND_REQUEST),
        ProtocolOp::SearchRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_SEARCH_REQUEST);
            writer.write_string(&req.base_object);
            writer.write_enumerated(req.scope as i32);
            writer.write_enumerated(req.deref_aliases as i32);
            writer.write_integer(req.size_limit as i64);
            writer.write_integer(req.time_limit as i64);
            writer.write_boolean(req.types_only);
            req.filter.encode(writer)?;
            writer.write_start_sequence();
            for attribute in &req.attributes {
                writer.write_string(attribute);
            }
            writer.write_end_sequence()?;
            writer.write_end_sequence()?;
        }
        ProtocolOp::SearchResultEntry(entry) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_SEARCH_RESULT_ENTRY);
            writer.write_string(&entry.object_name);
            encode_attribute_list(writer, &entry.attributes)?;
            writer.write_end_sequence()?;
        }
        ProtocolOp::SearchResultReference(reference) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in &reference.uris {
                writer.write_string(uri);
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::SearchResultDone(result) => encode_ldap_result(writer, LDAP_TAG_SEARCH_RESULT_DONE, result)?,
        ProtocolOp::ModifyRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_MODIFY_REQUEST);
            writer.write_string(&req.object);
            writer.write_start_sequence();
            for change in &req.changes {
                writer.write_start_sequence();
                writer.write_enumerated(change.operation as i32);
                encode_attribute(writer, &change.modification)?;
                writer.write_end_sequence()?;
            }
            writer.write_end_sequence()?;
            writer.write_end_sequence()?;
        }
        ProtocolOp::ModifyResponse(result) => encode_ldap_result(writer, LDAP_TAG_MODIFY_RESPONSE, result)?,
        ProtocolOp::AddRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_ADD_REQUEST);
            writer.write_string(&req.entry);
            encode_attribute_list(writer, &req.attributes)?;
            writer.write_end_sequence()?;
        }
        ProtocolOp::AddResponse(result) => encode_ldap_result(writer, LDAP_TAG_ADD_RESPONSE, result)?,
        ProtocolOp::DelRequest(req) => writer.write_octet_string_with_tag(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes()),
        ProtocolOp::DelResponse(result) => encode_ldap_result(writer, LDAP_TAG_DEL_RESPONSE, result)?,
        ProtocolOp::ModifyDNRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_MODIFY_DN_REQUEST);
            writer.write_string(&req.entry);
            writer.write_string(&req.newrdn);
            writer.write_boolean(req.delete_old_rdn);
            if let Some(new_superior) = &req.new_superior {
                writer.write_octet_string_with_tag(TAG_NEW_SUPERIOR, new_superior.as_bytes());
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::ModifyDNResponse(result) => encode_ldap_result(writer, LDAP_TAG_MODIFY_DN_RESPONSE, result)?,
        ProtocolOp::CompareRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_COMPARE_REQUEST);
            writer.write_string(&req.entry);
            writer.write_start_sequence();
            writer.write_string(&req.attr);
            writer.write_octet_string(&req.assertion_value);
            writer.write_end_sequence()?;
            writer.write_end_sequence()?;
        }
        ProtocolOp::CompareResponse(result) => encode_ldap_result(writer, LDAP_TAG_COMPARE_RESPONSE, result)?,
        ProtocolOp::AbandonRequest(id) => writer.write_integer_with_tag(LDAP_TAG_ABANDON_REQUEST, *id as i64),
        ProtocolOp::ExtendedRequest(req) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_EXTENDED_REQUEST);
            writer.write_octet_string_with_tag(TAG_EXTENDED_REQUEST_NAME, req.request_name.as_bytes());
            if let Some(value) = &req.request_value {
                writer.write_octet_string_with_tag(TAG_EXTENDED_REQUEST_VALUE, value);
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::ExtendedResponse(resp) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_EXTENDED_RESPONSE);
            encode_result_components(writer, &resp.result)?;
            if let Some(name) = &resp.response_name {
                writer.write_octet_string_with_tag(TAG_EXTENDED_RESPONSE_NAME, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                writer.write_octet_string_with_tag(TAG_EXTENDED_RESPONSE_VALUE, value);
            }
            writer.write_end_sequence()?;
        }
        ProtocolOp::IntermediateResponse(resp) => {
            writer.write_start_sequence_with_tag(LDAP_TAG_INTERMEDIATE_RESPONSE);
            if let Some(name) = &resp.response_name {
                writer.write_octet_string_with_tag(TAG_INTERMEDIATE_NAME, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                writer.write_octet_string_with_tag(TAG_INTERMEDIATE_VALUE, value);
            }
            writer.write_end_sequence()?;
        }
    }
    Ok(())
}

fn encode_ldap_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) -> Result<(), LdapError> {
    writer.write_start_sequence_with_tag(tag);
    encode_result_components(writer, result)?;
    writer.write_end_sequence()
}

fn encode_result_components(writer: &mut BerWriter, result: &LdapResult) -> Result<(), LdapError> {
    writer.write_enumerated(result.result_code.0);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    if !result.referrals.is_empty() {
        writer.write_start_sequence_with_tag(TAG_REFERRAL);
        for uri in &result.referrals {
            writer.write_string(uri);
        }
        writer.write_end_sequence()?;
    }
    Ok(())
}

fn encode_attribute_list(writer: &mut BerWriter, attributes: &[Attribute]) -> Result<(), LdapError> {
    writer.write_start_sequence();
    for attribute in attributes {
        encode_attribute(writer, attribute)?;
    }
    writer.write_end_sequence()
}

fn encode_attribute(writer: &mut BerWriter, attribute: &Attribute) -> Result<(), LdapError> {
    writer.write_start_sequence();
    writer.write_string(&attribute.attr_type);
    writer.write_start_set();
    for value in &attribute.attr_values {
        writer.write_octet_string(value);
    }
    writer.write_end_set()?;
    writer.write_end_sequence()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 30 1A 02 01 01 60 15 02 01 03 04 08 "cn=admin" <auth tag> 06 "secret"
    fn simple_bind_bytes(auth_tag: u8) -> Vec<u8> {
        let mut data = vec![0x30, 0x1A, 0x02, 0x01, 0x01, 0x60, 0x15, 0x02, 0x01, 0x03, 0x04, 0x08];
        data.extend_from_slice(b"cn=admin");
        data.extend_from_slice(&[auth_tag, 0x06]);
        data.extend_from_slice(b"secret");
        data
    }

    #[test]
    fn test_parse_bind_request_simple() {
        let message = parse_ldap_message(&simple_bind_bytes(0x80)).unwrap();
        assert_eq!(message.message_id, 1);
        assert!(message.controls.is_empty());
        match message.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(req.version, 3);
                assert_eq!(req.name, "cn=admin");
                assert_eq!(req.authentication, BindAuthentication::Simple("secret".to_string()));
            }
            other => panic!("Expected BindRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bind_request_rejects_unknown_auth_tag() {
        for tag in [0x61, 0x41, 0xD0] {
            let err = parse_ldap_message(&simple_bind_bytes(tag)).unwrap_err();
            assert!(
                matches!(err, DecodeError::UnexpectedTag { expected: 0x80, actual } if actual == tag),
                "tag 0x{:02X}: {:?}",
                tag,
                err
            );
        }
    }

    #[test]
    fn test_encode_simple_bind_layout() {
        let message = LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("cn=admin", "secret")));
        assert_eq!(encode_ldap_message(&message).unwrap(), simple_bind_bytes(0x80));
    }

    #[test]
    fn test_parse_bind_request_sasl() {
        let mut data = vec![0x30, 0x1E, 0x02, 0x01, 0x01, 0x60, 0x19, 0x02, 0x01, 0x03, 0x04, 0x08];
        data.extend_from_slice(b"cn=admin");
        data.extend_from_slice(&[0xA3, 0x0A, 0x04, 0x08]);
        data.extend_from_slice(b"EXTERNAL");
        let message = parse_ldap_message(&data).unwrap();
        match message.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(
                    req.authentication,
                    BindAuthentication::Sasl {
                        mechanism: "EXTERNAL".to_string(),
                        credentials: None
                    }
                );
            }
            other => panic!("Expected BindRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bind_response() {
        let data = [0x30, 0x0C, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00];
        let message = parse_ldap_message(&data).unwrap();
        assert_eq!(
            message.protocol_op,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None
            })
        );
    }

    #[test]
    fn test_parse_bind_response_with_sasl_creds() {
        let data = [
            0x30, 0x11, 0x02, 0x01, 0x02, 0x61, 0x0C, 0x0A, 0x01, 0x0E, 0x04, 0x00, 0x04, 0x00, 0x87, 0x03, b'a',
            b'b', b'c',
        ];
        let message = parse_ldap_message(&data).unwrap();
        assert_eq!(message.message_id, 2);
        match message.protocol_op {
            ProtocolOp::BindResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::SASL_BIND_IN_PROGRESS);
                assert_eq!(resp.server_sasl_creds, Some(b"abc".to_vec()));
            }
            other => panic!("Expected BindResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_search_request_with_controls() {
        let request = SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::WholeSubtree,
            Filter::parse("(&(objectClass=person)(cn=j*))").unwrap(),
        )
        .with_attributes(["cn", "mail"])
        .with_size_limit(50);
        let mut message = LdapMessage::new(9, ProtocolOp::SearchRequest(request));
        message.controls = vec![
            Control::new("1.2.840.113556.1.4.319", true, Some(vec![0x30, 0x05, 0x02, 0x01, 0x0A, 0x04, 0x00])),
            Control::new("2.16.840.1.113730.3.4.2", false, None),
        ];

        let bytes = encode_ldap_message(&message).unwrap();
        assert_eq!(parse_ldap_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_control_criticality_defaults_to_false() {
        // controls [0] { SEQUENCE { "1.2.3" } }
        let data = [
            0x30, 0x10, 0x02, 0x01, 0x03, 0x42, 0x00, 0xA0, 0x09, 0x30, 0x07, 0x04, 0x05, b'1', b'.', b'2', b'.', b'3',
        ];
        let message = parse_ldap_message(&data).unwrap();
        assert_eq!(message.protocol_op, ProtocolOp::UnbindRequest);
        assert_eq!(message.controls, vec![Control::new("1.2.3", false, None)]);
    }

    #[test]
    fn test_search_result_messages() {
        let entry = SearchResultEntry {
            object_name: "uid=jdoe,ou=people,dc=example,dc=com".to_string(),
            attributes: vec![
                Attribute::new("cn", ["John Doe"]),
                Attribute::new("objectClass", ["top", "person"]),
            ],
        };
        let bytes = encode_ldap_message(&LdapMessage::new(4, ProtocolOp::SearchResultEntry(entry.clone()))).unwrap();
        assert_eq!(bytes[5], LDAP_TAG_SEARCH_RESULT_ENTRY);
        let parsed = parse_ldap_message(&bytes).unwrap();
        match parsed.protocol_op {
            ProtocolOp::SearchResultEntry(e) => {
                assert_eq!(e, entry);
                assert_eq!(e.attribute("OBJECTCLASS").unwrap().attr_values.len(), 2);
            }
            other => panic!("Expected SearchResultEntry, got {:?}", other),
        }

        let reference = SearchResultReference {
            uris: vec!["ldap://replica.example.com/dc=example,dc=com".to_string()],
        };
        let bytes = encode_ldap_message(&LdapMessage::new(4, ProtocolOp::SearchResultReference(reference.clone()))).unwrap();
        assert_eq!(bytes[5], LDAP_TAG_SEARCH_RESULT_REFERENCE);
        assert_eq!(parse_ldap_message(&bytes).unwrap().protocol_op, ProtocolOp::SearchResultReference(reference));

        let mut done = LdapResult::new(ResultCode::REFERRAL).with_diagnostic_message("go elsewhere");
        done.referrals = vec!["ldap://other.example.com/".to_string()];
        let bytes = encode_ldap_message(&LdapMessage::new(4, ProtocolOp::SearchResultDone(done.clone()))).unwrap();
        assert_eq!(parse_ldap_message(&bytes).unwrap().protocol_op, ProtocolOp::SearchResultDone(done));
    }

    #[test]
    fn test_write_requests_decode() {
        let ops = vec![
            ProtocolOp::AddRequest(AddRequest {
                entry: "cn=new,dc=example,dc=com".to_string(),
                attributes: vec![Attribute::new("objectClass", ["person"]), Attribute::new("sn", ["New"])],
            }),
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=new,dc=example,dc=com".to_string(),
                changes: vec![ModifyChange {
                    operation: ModifyOperation::Replace,
                    modification: Attribute::new("mail", ["new@example.com"]),
                }],
            }),
            ProtocolOp::ModifyDNRequest(ModifyDNRequest {
                entry: "cn=new,dc=example,dc=com".to_string(),
                newrdn: "cn=renamed".to_string(),
                delete_old_rdn: true,
                new_superior: Some("ou=moved,dc=example,dc=com".to_string()),
            }),
            ProtocolOp::CompareRequest(CompareRequest {
                entry: "cn=new,dc=example,dc=com".to_string(),
                attr: "sn".to_string(),
                assertion_value: b"New".to_vec(),
            }),
            ProtocolOp::ExtendedRequest(ExtendedRequest::new("1.3.6.1.4.1.4203.1.11.3", None)),
        ];
        for op in ops {
            let message = LdapMessage::new(12, op);
            let bytes = encode_ldap_message(&message).unwrap();
            assert_eq!(parse_ldap_message(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_primitive_operation_encodings() {
        let unbind = encode_ldap_message(&LdapMessage::new(3, ProtocolOp::UnbindRequest)).unwrap();
        assert_eq!(unbind, vec![0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);

        let abandon = encode_ldap_message(&LdapMessage::new(4, ProtocolOp::AbandonRequest(7))).unwrap();
        assert_eq!(abandon, vec![0x30, 0x06, 0x02, 0x01, 0x04, 0x50, 0x01, 0x07]);
        assert_eq!(parse_ldap_message(&abandon).unwrap().protocol_op, ProtocolOp::AbandonRequest(7));

        let delete = encode_ldap_message(&LdapMessage::new(
            5,
            ProtocolOp::DelRequest(DelRequest {
                entry: "cn=x".to_string(),
            }),
        ))
        .unwrap();
        assert_eq!(delete, vec![0x30, 0x09, 0x02, 0x01, 0x05, 0x4A, 0x04, b'c', b'n', b'=', b'x']);
    }

    #[test]
    fn test_extended_and_intermediate_responses() {
        let response = ExtendedResponse {
            result: LdapResult::success(),
            response_name: Some("1.3.6.1.4.1.4203.1.11.1".to_string()),
            response_value: Some(vec![0x30, 0x00]),
        };
        let bytes = encode_ldap_message(&LdapMessage::new(6, ProtocolOp::ExtendedResponse(response.clone()))).unwrap();
        assert_eq!(parse_ldap_message(&bytes).unwrap().protocol_op, ProtocolOp::ExtendedResponse(response));

        let intermediate = IntermediateResponse {
            response_name: Some("1.3.6.1.4.1.4203.1.9.1.4".to_string()),
            response_value: None,
        };
        let bytes =
            encode_ldap_message(&LdapMessage::new(6, ProtocolOp::IntermediateResponse(intermediate.clone()))).unwrap();
        assert_eq!(bytes[5], 0x79);
        assert_eq!(
            parse_ldap_message(&bytes).unwrap().protocol_op,
            ProtocolOp::IntermediateResponse(intermediate)
        );
    }

    #[test]
    fn test_unsupported_operation_tag() {
        let data = [0x30, 0x06, 0x02, 0x01, 0x05, 0x5F, 0x01, 0x00];
        assert_eq!(
            parse_ldap_message(&data),
            Err(DecodeError::UnsupportedMessage {
                message_id: 5,
                tag: 0x5F
            })
        );
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        assert_eq!(
            parse_ldap_message(&[0x04, 0x00]),
            Err(DecodeError::UnexpectedTag {
                expected: 0x30,
                actual: 0x04
            })
        );
        assert!(matches!(
            parse_ldap_message(&[0x30, 0x05, 0x02, 0x01, 0xFF, 0x42, 0x00]),
            Err(DecodeError::InvalidValue { field: "message ID", .. })
        ));
        assert!(parse_ldap_message(&[0x30, 0x05, 0x02, 0x01]).is_err());
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(7).is_err());
    }

    #[test]
    fn test_ldap_result_into_result() {
        assert!(LdapResult::new(ResultCode::COMPARE_TRUE).into_result().is_ok());
        let err = LdapResult::new(ResultCode::NO_SUCH_OBJECT)
            .with_matched_dn("dc=example,dc=com")
            .into_result()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "result code 32 (noSuchObject) (matched DN: dc=example,dc=com)"
        );
    }
}
