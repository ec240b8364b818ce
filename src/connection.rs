//! Multiplexed LDAP connection. Requests get a message ID and a pending entry;
//! a single reader task decodes inbound messages and routes each one to the
//! waiter registered under its ID.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::ber::BerReader;
use crate::error::{DecodeError, LdapError, ResultCode};
use crate::extended::{DecoderRegistry, ExtendedResult, NOTICE_OF_DISCONNECTION_OID, START_TLS_OID};
use crate::future::FutureResult;
use crate::ldap_protocol::{
    decode_ldap_message, encode_ldap_message, AddRequest, BindRequest, BindResponse, CompareRequest, Control,
    DecodeOptions, DelRequest, ExtendedRequest, ExtendedResponse, IntermediateResponse, LdapMessage, LdapResult,
    ModifyDNRequest, ModifyRequest, ProtocolOp, SearchRequest, SearchResultEntry, SearchResultReference,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long an abandoned operation waits for a late result before it is
/// completed with `LdapError::Cancelled`.
pub const DEFAULT_ABANDONED_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens to a pending operation when the caller abandons it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Keep the pending entry; a result that still arrives completes the future.
    #[default]
    DeliverLateResult,
    /// Drop the pending entry and complete the future with `LdapError::Cancelled`.
    /// A late result is discarded like any response to an unknown ID.
    CancelLocally,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub decode: DecodeOptions,
    /// Maximum time an operation may go without activity. None disables the check.
    pub request_timeout: Option<Duration>,
    pub abandon_policy: AbandonPolicy,
    /// Inactivity limit for operations abandoned under `DeliverLateResult`.
    /// Servers do not answer abandoned operations, so this always applies.
    pub abandoned_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            decode: DecodeOptions::default(),
            request_timeout: None,
            abandon_policy: AbandonPolicy::default(),
            abandoned_timeout: DEFAULT_ABANDONED_TIMEOUT,
            read_buffer_size: 4096,
        }
    }
}

/// Transform applied to every outbound message and inbound chunk once a bind
/// or StartTLS that carried it has succeeded (SASL integrity/privacy, TLS).
pub trait SecurityLayer: Send + Sync {
    fn wrap_outbound(&self, data: &[u8]) -> Result<Vec<u8>, LdapError>;
    fn unwrap_inbound(&self, data: &[u8]) -> Result<Vec<u8>, LdapError>;
}

pub trait ConnectionEventListener: Send + Sync {
    /// Extended response with message ID 0.
    fn on_unsolicited_notification(&self, _connection_id: u64, _notification: &ExtendedResponse) {}
    fn on_connection_closed(&self, _connection_id: u64, _error: &LdapError) {}
}

/// An operation plus the request controls to send with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<T> {
    pub operation: T,
    pub controls: Vec<Control>,
}

impl<T> Request<T> {
    pub fn new(operation: T) -> Self {
        Self {
            operation,
            controls: Vec::new(),
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }
}

impl<T> From<T> for Request<T> {
    fn from(operation: T) -> Self {
        Self::new(operation)
    }
}

/// Everything a search returned. Entries and references are empty when a
/// handler consumed them as they arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub entries: Vec<SearchResultEntry>,
    pub references: Vec<SearchResultReference>,
    pub result: LdapResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchItem {
    Entry(SearchResultEntry),
    Reference(SearchResultReference),
}

impl SearchItem {
    fn name(&self) -> &'static str {
        match self {
            SearchItem::Entry(_) => "search result entry",
            SearchItem::Reference(_) => "search result reference",
        }
    }
}

type SearchHandler = Arc<dyn Fn(SearchItem) + Send + Sync>;
type IntermediateHandler = Arc<dyn Fn(IntermediateResponse) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimpleOp {
    Add,
    Delete,
    Modify,
    ModifyDn,
    Compare,
}

impl SimpleOp {
    fn take_result(self, response: ProtocolOp) -> Result<LdapResult, ProtocolOp> {
        match (self, response) {
            (SimpleOp::Add, ProtocolOp::AddResponse(result))
            | (SimpleOp::Delete, ProtocolOp::DelResponse(result))
            | (SimpleOp::Modify, ProtocolOp::ModifyResponse(result))
            | (SimpleOp::ModifyDn, ProtocolOp::ModifyDNResponse(result))
            | (SimpleOp::Compare, ProtocolOp::CompareResponse(result)) => Ok(result),
            (_, other) => Err(other),
        }
    }
}

enum PendingKind {
    Bind(FutureResult<BindResponse>),
    Search {
        future: FutureResult<SearchResult>,
        entries: Vec<SearchResultEntry>,
        references: Vec<SearchResultReference>,
        handler: Option<SearchHandler>,
    },
    Simple {
        op: SimpleOp,
        future: FutureResult<LdapResult>,
    },
    Extended {
        oid: String,
        future: FutureResult<ExtendedResult>,
    },
}

struct PendingOperation {
    kind: PendingKind,
    intermediate: Option<IntermediateHandler>,
    last_activity: Instant,
    // Abandoned, still waiting for a late result.
    abandoned: bool,
    // Installed when this bind/StartTLS succeeds.
    security_layer: Option<Arc<dyn SecurityLayer>>,
}

impl PendingKind {
    fn mark_delivering(&self) {
        match self {
            PendingKind::Bind(future) => future.mark_delivering(),
            PendingKind::Search { future, .. } => future.mark_delivering(),
            PendingKind::Simple { future, .. } => future.mark_delivering(),
            PendingKind::Extended { future, .. } => future.mark_delivering(),
        }
    }

    fn fail(self, error: LdapError) {
        match self {
            PendingKind::Bind(future) => {
                future.complete(Err(error));
            }
            PendingKind::Search { future, .. } => {
                future.complete(Err(error));
            }
            PendingKind::Simple { future, .. } => {
                future.complete(Err(error));
            }
            PendingKind::Extended { future, .. } => {
                future.complete(Err(error));
            }
        }
    }
}

impl PendingOperation {
    fn fail(self, error: LdapError) {
        self.kind.fail(error);
    }

    fn complete(
        self,
        message_id: i32,
        response: ProtocolOp,
        controls: Vec<Control>,
        registry: &DecoderRegistry,
        options: &DecodeOptions,
    ) {
        let operation = response.name();
        let unexpected = LdapError::Decode(DecodeError::UnexpectedMessage {
            message_id,
            operation,
        });
        match (self.kind, response) {
            (PendingKind::Bind(future), ProtocolOp::BindResponse(mut response)) => {
                response.result.controls = controls;
                let outcome = if response.result.result_code.is_exceptional() {
                    Err(LdapError::Operation(response.result))
                } else {
                    Ok(response)
                };
                future.complete(outcome);
            }
            (
                PendingKind::Search {
                    future,
                    entries,
                    references,
                    ..
                },
                ProtocolOp::SearchResultDone(mut result),
            ) => {
                result.controls = controls;
                future.complete(result.into_result().map(|result| SearchResult {
                    entries,
                    references,
                    result,
                }));
            }
            (PendingKind::Simple { op, future }, response) => match op.take_result(response) {
                Ok(mut result) => {
                    result.controls = controls;
                    future.complete(result.into_result());
                }
                Err(_) => {
                    warn!("Unexpected {} for message ID {}", operation, message_id);
                    future.complete(Err(unexpected));
                }
            },
            (PendingKind::Extended { oid, future }, ProtocolOp::ExtendedResponse(mut response)) => {
                response.result.controls = controls;
                future.complete(registry.decode(&oid, response, options));
            }
            (kind, _) => {
                warn!("Unexpected {} for message ID {}", operation, message_id);
                kind.fail(unexpected);
            }
        }
    }
}

struct ConnectionState {
    next_message_id: i32,
    pending: HashMap<i32, PendingOperation>,
    // Message ID of the outstanding bind or StartTLS, if any.
    security_operation: Option<i32>,
    closed: Option<LdapError>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            next_message_id: 1,
            pending: HashMap::new(),
            security_operation: None,
            closed: None,
        }
    }

    /// IDs run from 1 to i32::MAX, then wrap to 1. IDs still pending are skipped.
    fn allocate_message_id(&mut self) -> i32 {
        loop {
            let id = self.next_message_id;
            self.next_message_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn remove(&mut self, message_id: i32) -> Option<PendingOperation> {
        let removed = self.pending.remove(&message_id);
        if removed.is_some() && self.security_operation == Some(message_id) {
            self.security_operation = None;
        }
        removed
    }
}

enum Outbound {
    Message(Vec<u8>),
    Shutdown,
}

struct InstalledLayer(Arc<dyn SecurityLayer>);

struct Inner {
    id: u64,
    options: ConnectionOptions,
    registry: Arc<DecoderRegistry>,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    security_layer: ArcSwapOption<InstalledLayer>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

/// Handle to one LDAP connection. Clones share the same transport; the
/// connection is closed when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("valid", &self.is_valid())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Connection {
    /// Starts the reader and writer tasks on the current tokio runtime.
    pub fn from_stream<S>(stream: S, options: ConnectionOptions, registry: Arc<DecoderRegistry>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            id,
            options: options.clone(),
            registry,
            state: Mutex::new(ConnectionState::new()),
            outbound,
            security_layer: ArcSwapOption::empty(),
            shutdown,
            listeners: Mutex::new(Vec::new()),
        });

        tokio::spawn(read_loop(read_half, Arc::downgrade(&inner), shutdown_rx.clone(), options.clone()));
        tokio::spawn(write_loop(write_half, outbound_rx, Arc::downgrade(&inner)));
        tokio::spawn(timeout_loop(Arc::downgrade(&inner), shutdown_rx));
        debug!("Connection {} established", id);
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// False once the connection has been closed or has failed.
    pub fn is_valid(&self) -> bool {
        self.inner.lock_state().closed.is_none()
    }

    /// The error that closed the connection, if it is closed.
    pub fn closed_reason(&self) -> Option<LdapError> {
        self.inner.lock_state().closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn bind(&self, request: impl Into<Request<BindRequest>>) -> Result<FutureResult<BindResponse>, LdapError> {
        let request = request.into();
        self.inner.submit(
            ProtocolOp::BindRequest(request.operation),
            request.controls,
            None,
            None,
            PendingKind::Bind,
        )
    }

    pub fn simple_bind(&self, dn: &str, password: &str) -> Result<FutureResult<BindResponse>, LdapError> {
        self.bind(BindRequest::simple(dn, password))
    }

    /// Bind whose success installs `layer` for all later traffic.
    pub fn bind_with_security_layer(
        &self,
        request: impl Into<Request<BindRequest>>,
        layer: Arc<dyn SecurityLayer>,
    ) -> Result<FutureResult<BindResponse>, LdapError> {
        let request = request.into();
        self.inner.submit(
            ProtocolOp::BindRequest(request.operation),
            request.controls,
            Some(layer),
            None,
            PendingKind::Bind,
        )
    }

    /// StartTLS extended operation; `layer` is installed when it succeeds.
    pub fn start_tls(&self, layer: Arc<dyn SecurityLayer>) -> Result<FutureResult<ExtendedResult>, LdapError> {
        self.inner.submit(
            ProtocolOp::ExtendedRequest(ExtendedRequest::start_tls()),
            Vec::new(),
            Some(layer),
            None,
            |future| PendingKind::Extended {
                oid: START_TLS_OID.to_string(),
                future,
            },
        )
    }

    /// Search collecting every entry and reference into the final `SearchResult`.
    pub fn search(&self, request: impl Into<Request<SearchRequest>>) -> Result<FutureResult<SearchResult>, LdapError> {
        self.submit_search(request.into(), None)
    }

    /// Search streaming entries and references to `handler` on the reader task.
    pub fn search_with_handler(
        &self,
        request: impl Into<Request<SearchRequest>>,
        handler: impl Fn(SearchItem) + Send + Sync + 'static,
    ) -> Result<FutureResult<SearchResult>, LdapError> {
        self.submit_search(request.into(), Some(Arc::new(handler)))
    }

    fn submit_search(
        &self,
        request: Request<SearchRequest>,
        handler: Option<SearchHandler>,
    ) -> Result<FutureResult<SearchResult>, LdapError> {
        self.inner.submit(
            ProtocolOp::SearchRequest(request.operation),
            request.controls,
            None,
            None,
            |future| PendingKind::Search {
                future,
                entries: Vec::new(),
                references: Vec::new(),
                handler,
            },
        )
    }

    pub fn add(&self, request: impl Into<Request<AddRequest>>) -> Result<FutureResult<LdapResult>, LdapError> {
        let request = request.into();
        self.submit_simple(ProtocolOp::AddRequest(request.operation), request.controls, SimpleOp::Add)
    }

    pub fn modify(&self, request: impl Into<Request<ModifyRequest>>) -> Result<FutureResult<LdapResult>, LdapError> {
        let request = request.into();
        self.submit_simple(ProtocolOp::ModifyRequest(request.operation), request.controls, SimpleOp::Modify)
    }

    pub fn modify_dn(
        &self,
        request: impl Into<Request<ModifyDNRequest>>,
    ) -> Result<FutureResult<LdapResult>, LdapError> {
        let request = request.into();
        self.submit_simple(ProtocolOp::ModifyDNRequest(request.operation), request.controls, SimpleOp::ModifyDn)
    }

    pub fn delete(&self, request: impl Into<Request<DelRequest>>) -> Result<FutureResult<LdapResult>, LdapError> {
        let request = request.into();
        self.submit_simple(ProtocolOp::DelRequest(request.operation), request.controls, SimpleOp::Delete)
    }

    /// Completes with compareTrue or compareFalse in the result code.
    pub fn compare(&self, request: impl Into<Request<CompareRequest>>) -> Result<FutureResult<LdapResult>, LdapError> {
        let request = request.into();
        self.submit_simple(ProtocolOp::CompareRequest(request.operation), request.controls, SimpleOp::Compare)
    }

    fn submit_simple(
        &self,
        protocol_op: ProtocolOp,
        controls: Vec<Control>,
        op: SimpleOp,
    ) -> Result<FutureResult<LdapResult>, LdapError> {
        self.inner
            .submit(protocol_op, controls, None, None, |future| PendingKind::Simple { op, future })
    }

    pub fn extended(
        &self,
        request: impl Into<Request<ExtendedRequest>>,
    ) -> Result<FutureResult<ExtendedResult>, LdapError> {
        self.submit_extended(request.into(), None)
    }

    /// Extended operation whose intermediate responses go to `handler`.
    pub fn extended_with_handler(
        &self,
        request: impl Into<Request<ExtendedRequest>>,
        handler: impl Fn(IntermediateResponse) + Send + Sync + 'static,
    ) -> Result<FutureResult<ExtendedResult>, LdapError> {
        self.submit_extended(request.into(), Some(Arc::new(handler)))
    }

    fn submit_extended(
        &self,
        request: Request<ExtendedRequest>,
        intermediate: Option<IntermediateHandler>,
    ) -> Result<FutureResult<ExtendedResult>, LdapError> {
        let oid = request.operation.request_name.clone();
        self.inner.submit(
            ProtocolOp::ExtendedRequest(request.operation),
            request.controls,
            None,
            intermediate,
            |future| PendingKind::Extended { oid, future },
        )
    }

    /// Sends an abandon request for `message_id`. What happens to the pending
    /// entry depends on the connection's `AbandonPolicy`.
    pub fn abandon(&self, message_id: i32) -> Result<(), LdapError> {
        self.inner.abandon(message_id)
    }

    /// Sends an unbind and fails every pending operation with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.close();
    }
}

fn is_security_request(op: &ProtocolOp) -> bool {
    match op {
        ProtocolOp::BindRequest(_) => true,
        ProtocolOp::ExtendedRequest(request) => request.request_name == START_TLS_OID,
        _ => false,
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn enqueue(&self, bytes: Vec<u8>) -> Result<(), LdapError> {
        let bytes = match self.security_layer.load_full() {
            Some(layer) => layer.0.wrap_outbound(&bytes)?,
            None => bytes,
        };
        self.outbound
            .send(Outbound::Message(bytes))
            .map_err(|_| LdapError::ConnectionClosed)
    }

    fn enqueue_abandon(&self, state: &mut ConnectionState, target: i32) -> Result<(), LdapError> {
        let message_id = state.allocate_message_id();
        let bytes = encode_ldap_message(&LdapMessage::new(message_id, ProtocolOp::AbandonRequest(target)))?;
        self.enqueue(bytes)
    }

    /// Registers and sends one request. The checks, ID allocation, table
    /// insert and enqueue happen under one lock so no response can race them.
    fn submit<T: Send + 'static>(
        self: &Arc<Self>,
        protocol_op: ProtocolOp,
        controls: Vec<Control>,
        security_layer: Option<Arc<dyn SecurityLayer>>,
        intermediate: Option<IntermediateHandler>,
        kind: impl FnOnce(FutureResult<T>) -> PendingKind,
    ) -> Result<FutureResult<T>, LdapError> {
        let is_security = is_security_request(&protocol_op);
        let operation = protocol_op.name();
        let mut state = self.lock_state();
        if state.closed.is_some() {
            return Err(LdapError::ConnectionClosed);
        }
        if state.security_operation.is_some() {
            return Err(LdapError::SecurityOperationInProgress);
        }
        if is_security && state.pending.values().any(|pending| !pending.abandoned) {
            return Err(LdapError::OperationsPending);
        }

        let message_id = state.allocate_message_id();
        let bytes = encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op,
            controls,
        })?;
        self.enqueue(bytes)?;

        let future = FutureResult::new(message_id);
        let weak = Arc::downgrade(self);
        future.set_cancel_hook(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_operation(message_id);
            }
        });
        state.pending.insert(
            message_id,
            PendingOperation {
                kind: kind(future.clone()),
                intermediate,
                last_activity: Instant::now(),
                abandoned: false,
                security_layer,
            },
        );
        if is_security {
            state.security_operation = Some(message_id);
        }
        trace!("Connection {}: sent {} with message ID {}", self.id, operation, message_id);
        Ok(future)
    }

    fn abandon(&self, message_id: i32) -> Result<(), LdapError> {
        let removed = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return Err(LdapError::ConnectionClosed);
            }
            let removed = match self.options.abandon_policy {
                AbandonPolicy::CancelLocally => state.remove(message_id),
                AbandonPolicy::DeliverLateResult => {
                    if let Some(pending) = state.pending.get_mut(&message_id) {
                        pending.abandoned = true;
                        pending.last_activity = Instant::now();
                    }
                    None
                }
            };
            self.enqueue_abandon(&mut state, message_id)?;
            removed
        };
        debug!("Connection {}: abandoned message ID {}", self.id, message_id);
        if let Some(operation) = removed {
            operation.fail(LdapError::Cancelled);
        }
        Ok(())
    }

    // Cancel hook of a FutureResult; the future already holds `Cancelled`.
    fn cancel_operation(&self, message_id: i32) {
        let mut state = self.lock_state();
        if state.closed.is_some() || state.remove(message_id).is_none() {
            return;
        }
        debug!("Connection {}: cancelled message ID {}", self.id, message_id);
        if let Err(e) = self.enqueue_abandon(&mut state, message_id) {
            debug!("Connection {}: could not send abandon: {}", self.id, e);
        }
    }

    fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return;
            }
            let message_id = state.allocate_message_id();
            let unbind = encode_ldap_message(&LdapMessage::new(message_id, ProtocolOp::UnbindRequest))
                .and_then(|bytes| self.enqueue(bytes));
            if let Err(e) = unbind {
                debug!("Connection {}: could not send unbind: {}", self.id, e);
            }
        }
        self.fail(LdapError::ConnectionClosed);
    }

    /// Marks the connection closed and fails every pending operation once.
    fn fail(&self, error: LdapError) {
        let pending = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(error.clone());
            state.security_operation = None;
            std::mem::take(&mut state.pending)
        };
        match &error {
            LdapError::ConnectionClosed => debug!("Connection {} closed", self.id),
            other => info!("Connection {} closed: {}", self.id, other),
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        self.shutdown.send_replace(true);
        for (_, operation) in pending {
            operation.fail(error.clone());
        }
        for listener in self.listeners() {
            listener.on_connection_closed(self.id, &error);
        }
    }

    fn process_inbound(&self, reader: &mut BerReader, chunk: &[u8]) -> Result<(), LdapError> {
        match self.security_layer.load_full() {
            Some(layer) => reader.append(&layer.0.unwrap_inbound(chunk)?),
            None => reader.append(chunk),
        }
        while reader.element_available()? {
            let message = decode_ldap_message(reader)?;
            if !self.handle_message(message) {
                continue;
            }
            // Whatever followed the response that installed the layer was wrapped by it.
            if let (Some(layer), Some(unread)) = (self.security_layer.load_full(), reader.take_unread()) {
                if !unread.is_empty() {
                    reader.append(&layer.0.unwrap_inbound(&unread)?);
                }
            }
        }
        reader.compact();
        Ok(())
    }

    /// True when the message completed a bind or StartTLS that installed a
    /// security layer.
    fn handle_message(&self, message: LdapMessage) -> bool {
        let LdapMessage {
            message_id,
            protocol_op,
            controls,
        } = message;
        trace!("Connection {}: received {} for message ID {}", self.id, protocol_op.name(), message_id);
        if message_id == 0 {
            self.handle_unsolicited(protocol_op);
            return false;
        }
        if protocol_op.is_request() {
            warn!(
                "Connection {}: discarding {} sent by the server (message ID {})",
                self.id,
                protocol_op.name(),
                message_id
            );
            return false;
        }
        match protocol_op {
            ProtocolOp::SearchResultEntry(entry) => self.deliver_search_item(message_id, SearchItem::Entry(entry)),
            ProtocolOp::SearchResultReference(reference) => {
                self.deliver_search_item(message_id, SearchItem::Reference(reference))
            }
            ProtocolOp::IntermediateResponse(response) => self.deliver_intermediate(message_id, response),
            response => return self.complete_operation(message_id, response, controls),
        }
        false
    }

    fn handle_unsolicited(&self, protocol_op: ProtocolOp) {
        let ProtocolOp::ExtendedResponse(notification) = protocol_op else {
            debug!(
                "Connection {}: discarding {} with message ID 0",
                self.id,
                protocol_op.name()
            );
            return;
        };
        for listener in self.listeners() {
            listener.on_unsolicited_notification(self.id, &notification);
        }
        if notification.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
            warn!(
                "Connection {}: notice of disconnection: {}",
                self.id, notification.result
            );
            self.fail(LdapError::ServerDown(format!(
                "notice of disconnection: {}",
                notification.result
            )));
        } else {
            info!(
                "Connection {}: unsolicited notification {}",
                self.id,
                notification.response_name.as_deref().unwrap_or("<no name>")
            );
        }
    }

    fn discard_unknown(&self, message_id: i32, operation: &str) {
        debug!(
            "Connection {}: discarding {} for unknown message ID {}",
            self.id, operation, message_id
        );
    }

    fn fail_unexpected(&self, mut state: MutexGuard<'_, ConnectionState>, message_id: i32, operation: &'static str) {
        let removed = state.remove(message_id);
        drop(state);
        warn!("Connection {}: unexpected {} for message ID {}", self.id, operation, message_id);
        if let Some(pending) = removed {
            pending.fail(LdapError::Decode(DecodeError::UnexpectedMessage {
                message_id,
                operation,
            }));
        }
    }

    fn deliver_search_item(&self, message_id: i32, item: SearchItem) {
        let mut state = self.lock_state();
        let is_search = state
            .pending
            .get(&message_id)
            .map(|pending| matches!(pending.kind, PendingKind::Search { .. }));
        let Some(is_search) = is_search else {
            drop(state);
            self.discard_unknown(message_id, item.name());
            return;
        };
        if !is_search {
            self.fail_unexpected(state, message_id, item.name());
            return;
        }
        let Some(pending) = state.pending.get_mut(&message_id) else {
            return;
        };
        pending.last_activity = Instant::now();
        let PendingKind::Search {
            future,
            entries,
            references,
            handler,
        } = &mut pending.kind
        else {
            return;
        };
        future.mark_delivering();
        let handler = match handler {
            Some(handler) => Arc::clone(handler),
            None => {
                match item {
                    SearchItem::Entry(entry) => entries.push(entry),
                    SearchItem::Reference(reference) => references.push(reference),
                }
                return;
            }
        };
        drop(state);
        handler(item);
    }

    fn deliver_intermediate(&self, message_id: i32, response: IntermediateResponse) {
        let handler = {
            let mut state = self.lock_state();
            if !state.pending.contains_key(&message_id) {
                drop(state);
                self.discard_unknown(message_id, "intermediate response");
                return;
            }
            let Some(pending) = state.pending.get_mut(&message_id) else {
                return;
            };
            pending.last_activity = Instant::now();
            pending.kind.mark_delivering();
            pending.intermediate.clone()
        };
        match handler {
            Some(handler) => handler(response),
            None => debug!(
                "Connection {}: no handler for intermediate response to message ID {}",
                self.id, message_id
            ),
        }
    }

    /// Returns true when the response installed a security layer.
    fn complete_operation(&self, message_id: i32, response: ProtocolOp, controls: Vec<Control>) -> bool {
        let Some((pending, installed)) = self.take_for_completion(message_id, &response) else {
            self.discard_unknown(message_id, response.name());
            return false;
        };
        pending.complete(message_id, response, controls, &self.registry, &self.options.decode);
        installed
    }

    /// Removes the entry the response completes. Its future is marked
    /// delivering under the same lock, so a later cancel() loses to the result.
    fn take_for_completion(&self, message_id: i32, response: &ProtocolOp) -> Option<(PendingOperation, bool)> {
        let mut state = self.lock_state();
        state.pending.get(&message_id)?.kind.mark_delivering();
        let pending = state.remove(message_id)?;
        // Installed before the lock is released so the next request is wrapped.
        let installed = match &pending.security_layer {
            Some(layer) if security_operation_succeeded(response) => {
                self.security_layer.store(Some(Arc::new(InstalledLayer(Arc::clone(layer)))));
                debug!("Connection {}: security layer installed", self.id);
                true
            }
            _ => false,
        };
        Some((pending, installed))
    }

    /// Fails operations idle past the request timeout (sending an abandon) and
    /// abandoned operations idle past the abandoned timeout.
    fn expire_operations(&self) {
        let now = Instant::now();
        let request_timeout = self.options.request_timeout;
        let abandoned_timeout = self.options.abandoned_timeout;
        let (expired, security_expired) = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return;
            }
            let ids: Vec<(i32, bool)> = state
                .pending
                .iter()
                .filter(|(_, pending)| {
                    let idle = now.duration_since(pending.last_activity);
                    if pending.abandoned {
                        idle >= abandoned_timeout
                    } else {
                        request_timeout.is_some_and(|timeout| idle >= timeout)
                    }
                })
                .map(|(id, pending)| (*id, pending.abandoned))
                .collect();
            let security_expired = state
                .security_operation
                .filter(|security| ids.iter().any(|(id, _)| id == security));
            let mut expired = Vec::with_capacity(ids.len());
            for (id, abandoned) in ids {
                if let Some(pending) = state.remove(id) {
                    expired.push((id, abandoned, pending));
                    if abandoned {
                        continue;
                    }
                    if let Err(e) = self.enqueue_abandon(&mut state, id) {
                        debug!("Connection {}: could not send abandon: {}", self.id, e);
                    }
                }
            }
            (expired, security_expired)
        };
        let mut security_error = None;
        for (id, abandoned, pending) in expired {
            let error = if abandoned {
                debug!("Connection {}: no late result for abandoned message ID {}", self.id, id);
                LdapError::Cancelled
            } else {
                warn!(
                    "Connection {}: message ID {} timed out after {:?}",
                    self.id,
                    id,
                    now.duration_since(pending.last_activity)
                );
                LdapError::Timeout(request_timeout.unwrap_or(abandoned_timeout))
            };
            if security_expired == Some(id) {
                security_error = Some(error.clone());
            }
            pending.fail(error);
        }
        if let Some(error) = security_error {
            self.fail(error);
        }
    }
}

fn security_operation_succeeded(response: &ProtocolOp) -> bool {
    match response {
        ProtocolOp::BindResponse(response) => response.result.result_code == ResultCode::SUCCESS,
        ProtocolOp::ExtendedResponse(response) => response.result.result_code == ResultCode::SUCCESS,
        _ => false,
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(mut stream: R, inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>, options: ConnectionOptions)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BerReader::new(options.decode.max_element_size);
    let mut buffer = BytesMut::with_capacity(options.read_buffer_size);
    loop {
        buffer.clear();
        let read = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            read = stream.read_buf(&mut buffer) => read,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match read {
            Ok(0) => {
                inner.fail(LdapError::ServerDown("connection closed by the server".to_string()));
                break;
            }
            Ok(_) => {
                if let Err(e) = inner.process_inbound(&mut reader, &buffer) {
                    warn!("Connection {}: {}", inner.id, e);
                    inner.fail(e);
                    break;
                }
            }
            Err(e) => {
                inner.fail(LdapError::ServerDown(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop<W>(mut stream: W, mut outbound: mpsc::UnboundedReceiver<Outbound>, inner: Weak<Inner>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(bytes) => {
                let written = match stream.write_all(&bytes).await {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    if let Some(inner) = inner.upgrade() {
                        inner.fail(LdapError::ServerDown(e.to_string()));
                    }
                    break;
                }
            }
            Outbound::Shutdown => {
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
}

async fn timeout_loop(inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    let shortest = match inner.upgrade() {
        Some(inner) => inner
            .options
            .request_timeout
            .map_or(inner.options.abandoned_timeout, |timeout| {
                timeout.min(inner.options.abandoned_timeout)
            }),
        None => return,
    };
    let period = (shortest / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            _ = ticker.tick() => {}
        }
        match inner.upgrade() {
            Some(inner) => inner.expire_operations(),
            None => break,
        }
    }
}
