//! Request/response dispatch over a negotiated channel.
//!
//! One read loop per session decodes frames in order:
//! - responses complete the matching correlation entry
//! - requests go to the registered handler's queue (or a fresh task when the
//!   handler is reentrant); replies are written by the handler task, never by
//!   the read loop itself
//!
//! Any inbound protocol error faults the session and fails every pending
//! caller with that error.
//!
//! A full serial queue makes the read loop wait, and while it waits no
//! responses are read either. A non-reentrant handler that sends requests on
//! its own session can therefore deadlock once its backlog reaches
//! [`HANDLER_QUEUE_DEPTH`]; handlers that make nested requests should be
//! reentrant.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CorrelationId, Frame, FrameCodec};
use crate::bridge::error::ProtocolError;
use crate::bridge::protocol::{ErrorResponse, HANDSHAKE_TYPE, VoidResponse};
use crate::bridge::registry::{Message, MessageKind, MessageTypeId, SerializerRegistry, WireMessage};
use crate::bridge::transport::{Channel, ChannelError};

/// Requests queued per non-reentrant handler before the read loop waits.
pub const HANDLER_QUEUE_DEPTH: usize = 64;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for queued requests once the peer has hung up.
const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Split a channel into framed read and write halves sharing one codec.
pub fn framed(channel: Channel, codec: FrameCodec) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = channel.into_split();
    (
        FramedRead::new(read_half, codec.clone()),
        FramedWrite::new(write_half, codec),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Open,
    Closed,
    Faulted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("a handler for message type {0} is already registered")]
    HandlerAlreadyRegistered(MessageTypeId),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Serves one request type.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the reply; `None` answers with `VoidResponse`. Errors and
    /// panics are turned into an `ErrorResponse` for the caller.
    async fn handle(&self, request: Message) -> anyhow::Result<Option<Message>>;

    /// Reentrant handlers may run concurrently with themselves and never
    /// hold up the read loop. Handlers that await requests on their own
    /// session should say yes here.
    fn is_reentrant(&self) -> bool {
        false
    }
}

/// Closure-backed handler.
pub struct FnHandler<F> {
    f: F,
    reentrant: bool,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
{
    FnHandler { f, reentrant: false }
}

impl<F> FnHandler<F> {
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
{
    async fn handle(&self, request: Message) -> anyhow::Result<Option<Message>> {
        (self.f)(request).await
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

type Completion = oneshot::Sender<Result<Message, SessionError>>;

struct Shared {
    registry: Arc<SerializerRegistry>,
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: DashMap<CorrelationId, Completion>,
    next_correlation: AtomicU32,
    handlers: DashMap<MessageTypeId, Arc<dyn RequestHandler>>,
    state: watch::Sender<SessionState>,
    fault: OnceLock<SessionError>,
    closed: CancellationToken,
    default_timeout: Option<Duration>,
}

/// Removes a correlation entry when the waiting caller goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// Cloneable handle to a running session's dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("family", &self.shared.registry.family())
            .field("state", &*self.shared.state.borrow())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

impl Dispatcher {
    /// Build a dispatcher around the write half. Nothing is read until
    /// [`Dispatcher::start`] hands over the read half.
    pub fn new(
        registry: Arc<SerializerRegistry>,
        writer: FrameWriter,
        state: watch::Sender<SessionState>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                writer: tokio::sync::Mutex::new(writer),
                pending: DashMap::new(),
                next_correlation: AtomicU32::new(1),
                handlers: DashMap::new(),
                state,
                fault: OnceLock::new(),
                closed: CancellationToken::new(),
                default_timeout,
            }),
        }
    }

    /// Spawn the read loop and mark the session open.
    pub fn start(&self, reader: FrameReader) {
        self.shared.state.send_replace(SessionState::Open);
        tokio::spawn(read_loop(Arc::clone(&self.shared), reader));
    }

    pub fn registry(&self) -> &Arc<SerializerRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The error that faulted the session, if any.
    pub fn fault(&self) -> Option<SessionError> {
        self.shared.fault.get().cloned()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn register_handler(
        &self,
        type_id: MessageTypeId,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SessionError> {
        let shape = self.shared.registry.resolve(type_id)?;
        if shape.kind != MessageKind::Request || type_id == HANDSHAKE_TYPE {
            return Err(ProtocolError::invalid_message(format!(
                "{} is not a routable request type",
                shape.name
            ))
            .into());
        }
        match self.shared.handlers.entry(type_id) {
            Entry::Occupied(_) => Err(SessionError::HandlerAlreadyRegistered(type_id)),
            Entry::Vacant(slot) => {
                tracing::debug!(type_id, shape = %shape.name, "Registered request handler");
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Send a request and wait for its response using the default timeout.
    pub async fn send_request(&self, message: Message) -> Result<Message, SessionError> {
        self.send_request_with(message, self.shared.default_timeout, &CancellationToken::new())
            .await
    }

    pub async fn send_request_with(
        &self,
        message: Message,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Message, SessionError> {
        let shared = &*self.shared;
        shared.ensure_request(&message)?;

        let (tx, rx) = oneshot::channel();
        let id = shared.allocate_correlation(tx);
        let _guard = PendingGuard { shared, id };
        let type_id = message.type_id();

        let exchange = async {
            // Entries inserted after shutdown drained the table are never resolved.
            if shared.closed.is_cancelled() {
                return Err(shared.terminal_error());
            }
            shared.write_frame(Frame::new(id, message)).await?;
            tracing::trace!(type_id, correlation_id = id, "Awaiting response");
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(shared.terminal_error()),
            }
        };
        let deadline = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            result = exchange => result,
            _ = cancel.cancelled() => {
                tracing::debug!(type_id, correlation_id = id, "Request cancelled");
                Err(SessionError::Cancelled)
            }
            _ = deadline => {
                tracing::debug!(type_id, correlation_id = id, "Request timed out");
                Err(SessionError::Timeout(timeout.unwrap_or_default()))
            }
        }
    }

    /// Typed convenience over [`Dispatcher::send_request`].
    pub async fn request<M: WireMessage, R: WireMessage>(&self, request: &M) -> Result<R, SessionError> {
        let response = self.send_request(request.to_message()).await?;
        Ok(response.decode::<R>()?)
    }

    /// Send a request that expects no reply. Only write failures surface.
    pub async fn send_fire_and_forget(&self, message: Message) -> Result<(), SessionError> {
        self.shared.ensure_request(&message)?;
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.terminal_error());
        }
        self.shared.write_frame(Frame::uncorrelated(message)).await
    }

    /// Close the session and wait for the read loop to wind down. Idempotent.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.closed().await;
    }

    /// Wait until the session reaches `Closed` or `Faulted`.
    pub async fn closed(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        }
    }
}

impl Shared {
    fn ensure_request(&self, message: &Message) -> Result<(), SessionError> {
        let shape = self.registry.resolve(message.type_id())?;
        if shape.kind != MessageKind::Request || shape.type_id == HANDSHAKE_TYPE {
            return Err(ProtocolError::invalid_message(format!(
                "{} cannot be sent as a request",
                shape.name
            ))
            .into());
        }
        Ok(())
    }

    /// Next free id, skipping 0 and ids still in flight after wrap-around.
    fn allocate_correlation(&self, completion: Completion) -> CorrelationId {
        loop {
            let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(completion);
                return id;
            }
        }
    }

    fn terminal_error(&self) -> SessionError {
        self.fault.get().cloned().unwrap_or(SessionError::ChannelClosed)
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            writer = self.writer.lock() => writer,
        };
        let sent = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            sent = writer.send(frame) => sent,
        };
        match sent {
            Ok(()) => Ok(()),
            Err(ProtocolError::Io(e)) => {
                tracing::warn!(error = %e, "Channel write failed");
                drop(writer);
                self.fail(ProtocolError::Io(e).into());
                Err(SessionError::ChannelClosed)
            }
            // Encode failures leave the stream intact; only this caller fails.
            Err(e) => Err(e.into()),
        }
    }

    fn fail(&self, error: SessionError) {
        let _ = self.fault.set(error);
        self.closed.cancel();
    }

    async fn shutdown(&self, outcome: Result<(), SessionError>) {
        if let Err(e) = outcome {
            tracing::error!(error = %e, family = %self.registry.family(), "Session faulted");
            let _ = self.fault.set(e);
        }
        self.closed.cancel();

        let error = self.terminal_error();
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, completion)) = self.pending.remove(&id) {
                let _ = completion.send(Err(error.clone()));
            }
        }

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(error = %e, "Error closing write half"),
            Err(_) => tracing::debug!("Peer stopped reading; abandoning unflushed frames"),
        }
        drop(writer);

        let state = if self.fault.get().is_some() {
            SessionState::Faulted
        } else {
            SessionState::Closed
        };
        tracing::debug!(?state, "Session ended");
        self.state.send_replace(state);
    }

    async fn reply(&self, correlation_id: CorrelationId, reply: Message) {
        let reply_type = reply.type_id();
        match self.write_frame(Frame::new(correlation_id, reply)).await {
            Ok(()) => {}
            Err(SessionError::Protocol(e)) => {
                tracing::warn!(correlation_id, reply_type, error = %e, "Reply could not be encoded");
                let fallback = ErrorResponse {
                    message: format!("reply could not be encoded: {e}"),
                };
                if let Err(e) = self
                    .write_frame(Frame::new(correlation_id, fallback.to_message()))
                    .await
                {
                    tracing::debug!(correlation_id, error = %e, "Failed to send error reply");
                }
            }
            Err(e) => {
                tracing::debug!(correlation_id, reply_type, error = %e, "Failed to send reply");
            }
        }
    }

    fn complete(&self, frame: Frame) {
        let Frame {
            correlation_id,
            message,
        } = frame;
        if correlation_id == 0 {
            tracing::warn!(type_id = message.type_id(), "Dropping uncorrelated response");
            return;
        }
        let Some((_, completion)) = self.pending.remove(&correlation_id) else {
            tracing::warn!(
                type_id = message.type_id(),
                correlation_id,
                "Response for unknown or abandoned request"
            );
            return;
        };
        let result = if message.type_id() == ErrorResponse::TYPE_ID {
            let remote = ErrorResponse::from_message(&message)
                .map(|e| e.message)
                .unwrap_or_default();
            Err(SessionError::Remote(remote))
        } else {
            Ok(message)
        };
        let _ = completion.send(result);
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let mut queues: HashMap<MessageTypeId, mpsc::Sender<Frame>> = HashMap::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break Ok(()),
            next = reader.next() => next,
        };
        let frame = match next {
            None => {
                tracing::debug!("Peer closed the channel");
                break Ok(());
            }
            Some(Err(e)) => break Err(SessionError::from(e)),
            Some(Ok(frame)) => frame,
        };

        let type_id = frame.message.type_id();
        let kind = match shared.registry.resolve(type_id) {
            Ok(shape) => shape.kind,
            Err(e) => break Err(e.into()),
        };
        tracing::trace!(type_id, correlation_id = frame.correlation_id, ?kind, "Frame received");

        if type_id == HANDSHAKE_TYPE {
            break Err(ProtocolError::HandshakeViolation(
                "handshake received after negotiation".into(),
            )
            .into());
        }
        match kind {
            MessageKind::Response => shared.complete(frame),
            MessageKind::Request => route_request(&shared, &mut queues, &mut workers, frame).await,
        }
    };

    // Let serial handlers finish what the peer sent before it hung up.
    drop(queues);
    if outcome.is_ok() && !shared.closed.is_cancelled() {
        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(HANDLER_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!("Handlers still busy at session end");
        }
    }
    shared.shutdown(outcome).await;
}

async fn route_request(
    shared: &Arc<Shared>,
    queues: &mut HashMap<MessageTypeId, mpsc::Sender<Frame>>,
    workers: &mut Vec<JoinHandle<()>>,
    frame: Frame,
) {
    let type_id = frame.message.type_id();
    let Some(handler) = shared.handlers.get(&type_id).map(|h| Arc::clone(h.value())) else {
        tracing::warn!(type_id, correlation_id = frame.correlation_id, "No handler registered");
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let reply = ErrorResponse {
                message: format!("no handler registered for message type {type_id}"),
            };
            shared.reply(frame.correlation_id, reply.to_message()).await;
        });
        return;
    };

    if handler.is_reentrant() {
        let shared = Arc::clone(shared);
        tokio::spawn(async move { run_handler(&shared, handler.as_ref(), frame).await });
        return;
    }

    let queue = queues.entry(type_id).or_insert_with(|| {
        let (tx, mut rx) = mpsc::channel::<Frame>(HANDLER_QUEUE_DEPTH);
        let shared = Arc::clone(shared);
        workers.push(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                run_handler(&shared, handler.as_ref(), frame).await;
            }
        }));
        tx
    });
    if queue.send(frame).await.is_err() {
        tracing::error!(type_id, "Handler worker is gone");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn run_handler(shared: &Shared, handler: &dyn RequestHandler, frame: Frame) {
    let Frame {
        correlation_id,
        message,
    } = frame;
    let type_id = message.type_id();

    let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
    let reply = match outcome {
        Ok(Ok(Some(reply))) => match shared.registry.resolve(reply.type_id()) {
            Ok(shape) if shape.kind == MessageKind::Response => reply,
            _ => {
                tracing::warn!(type_id, reply_type = reply.type_id(), "Handler replied with a non-response");
                ErrorResponse {
                    message: format!("handler replied with message type {}", reply.type_id()),
                }
                .to_message()
            }
        },
        Ok(Ok(None)) => VoidResponse.to_message(),
        Ok(Err(e)) => {
            tracing::warn!(type_id, correlation_id, error = %e, "Handler failed");
            ErrorResponse {
                message: format!("{e:#}"),
            }
            .to_message()
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(type_id, correlation_id, panic = %message, "Handler panicked");
            ErrorResponse { message }.to_message()
        }
    };

    if correlation_id == 0 {
        return;
    }
    shared.reply(correlation_id, reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::{FieldSpec, MessageShape};
    use std::sync::atomic::AtomicUsize;

    const PING: MessageTypeId = 4;
    const PONG: MessageTypeId = 5;
    const SLOW: MessageTypeId = 6;

    fn registry() -> Arc<SerializerRegistry> {
        let mut registry = SerializerRegistry::new("test");
        registry
            .register(MessageShape::request(PING, "Ping").field(FieldSpec::int32(1, "n")))
            .unwrap();
        registry
            .register(MessageShape::response(PONG, "Pong").field(FieldSpec::int32(1, "n")))
            .unwrap();
        registry
            .register(MessageShape::request(SLOW, "Slow").field(FieldSpec::int32(1, "n")))
            .unwrap();
        Arc::new(registry)
    }

    fn ping(n: i32) -> Message {
        Message::empty(PING).with_field(1, n)
    }

    fn pong(n: i32) -> Message {
        Message::empty(PONG).with_field(1, n)
    }

    /// Dispatcher on one end, raw framed halves on the other.
    fn dispatcher_and_peer() -> (Dispatcher, FrameReader, FrameWriter) {
        let registry = registry();
        let (a, b) = Channel::pair().unwrap();
        let (reader, writer) = framed(a, FrameCodec::new(Arc::clone(&registry)));
        let (state, _) = watch::channel(SessionState::Handshaking);
        let dispatcher = Dispatcher::new(Arc::clone(&registry), writer, state, None);
        dispatcher.start(reader);
        let (peer_reader, peer_writer) = framed(b, FrameCodec::new(registry));
        (dispatcher, peer_reader, peer_writer)
    }

    /// Two connected, started dispatchers.
    fn dispatcher_pair() -> (Dispatcher, Dispatcher) {
        let registry = registry();
        let (a, b) = Channel::pair().unwrap();
        let start = |channel| {
            let (reader, writer) = framed(channel, FrameCodec::new(Arc::clone(&registry)));
            let (state, _) = watch::channel(SessionState::Handshaking);
            let dispatcher = Dispatcher::new(Arc::clone(&registry), writer, state, None);
            dispatcher.start(reader);
            dispatcher
        };
        (start(a), start(b))
    }

    fn n_of(message: &Message) -> i32 {
        message.fields().get_i32(1).unwrap()
    }

    #[tokio::test]
    async fn ping_pong_over_loopback() {
        let (client, server) = dispatcher_pair();
        server
            .register_handler(
                PING,
                Arc::new(handler_fn(|req: Message| async move {
                    Ok(Some(pong(n_of(&req) + 1)))
                })),
            )
            .unwrap();

        let reply = client.send_request(ping(41)).await.unwrap();
        assert_eq!(reply.type_id(), PONG);
        assert_eq!(n_of(&reply), 42);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_answered_in_reverse_order() {
        const N: i32 = 16;
        let (client, mut peer_reader, mut peer_writer) = dispatcher_and_peer();

        let mut calls = Vec::new();
        for n in 0..N {
            let client = client.clone();
            calls.push(tokio::spawn(async move { client.send_request(ping(n)).await }));
        }

        let mut received = Vec::new();
        for _ in 0..N {
            received.push(peer_reader.next().await.unwrap().unwrap());
        }
        let ids: std::collections::HashSet<_> = received.iter().map(|f| f.correlation_id).collect();
        assert_eq!(ids.len(), N as usize);
        assert!(!ids.contains(&0));

        for frame in received.into_iter().rev() {
            let n = n_of(&frame.message);
            peer_writer
                .send(Frame::new(frame.correlation_id, pong(n * 10)))
                .await
                .unwrap();
        }

        for (n, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(n_of(&reply), n as i32 * 10);
        }
    }

    #[tokio::test]
    async fn handler_can_call_back_into_the_requester() {
        let (client, server) = dispatcher_pair();
        client
            .register_handler(
                SLOW,
                Arc::new(handler_fn(|req: Message| async move {
                    Ok(Some(pong(n_of(&req) * 2)))
                })),
            )
            .unwrap();
        let callback = server.clone();
        server
            .register_handler(
                PING,
                Arc::new(
                    handler_fn(move |req: Message| {
                        let callback = callback.clone();
                        async move {
                            let nested = Message::empty(SLOW).with_field(1, n_of(&req));
                            let doubled = n_of(&callback.send_request(nested).await?);
                            Ok(Some(pong(doubled + 1)))
                        }
                    })
                    .reentrant(),
                ),
            )
            .unwrap();

        let calls = (0..8).map(|n| client.send_request(ping(n)));
        let replies = futures::future::join_all(calls).await;
        let values: Vec<_> = replies.iter().map(|r| n_of(r.as_ref().unwrap())).collect();
        assert_eq!(values, (0..8).map(|n| n * 2 + 1).collect::<Vec<_>>());

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn handler_error_becomes_remote_error() {
        let (client, server) = dispatcher_pair();
        server
            .register_handler(
                PING,
                Arc::new(handler_fn(|_req: Message| async move {
                    Err(anyhow::anyhow!("boom"))
                })),
            )
            .unwrap();

        let err = client.send_request(ping(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(ref msg) if msg == "boom"));
        assert_eq!(server.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn handler_panic_becomes_remote_error() {
        let (client, server) = dispatcher_pair();
        server
            .register_handler(
                PING,
                Arc::new(handler_fn(|req: Message| async move {
                    if n_of(&req) == 0 {
                        panic!("zero is not allowed");
                    }
                    Ok(Some(pong(1)))
                })),
            )
            .unwrap();

        let err = client.send_request(ping(0)).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(ref msg) if msg.contains("zero is not allowed")));
        // The handler keeps serving after a panic.
        assert_eq!(n_of(&client.send_request(ping(5)).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn void_handler_replies_with_void_response() {
        let (client, server) = dispatcher_pair();
        server
            .register_handler(PING, Arc::new(handler_fn(|_req: Message| async move { Ok(None) })))
            .unwrap();
        let reply = client.send_request(ping(1)).await.unwrap();
        assert_eq!(reply.type_id(), VoidResponse::TYPE_ID);
    }

    #[tokio::test]
    async fn missing_handler_yields_remote_error() {
        let (client, _server) = dispatcher_pair();
        let err = client.send_request(ping(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(ref msg) if msg.contains("no handler")));
    }

    #[tokio::test]
    async fn duplicate_handler_registration_is_rejected() {
        let (_client, server) = dispatcher_pair();
        let handler = || Arc::new(handler_fn(|_req: Message| async move { Ok(None) }));
        server.register_handler(PING, handler()).unwrap();
        assert!(matches!(
            server.register_handler(PING, handler()),
            Err(SessionError::HandlerAlreadyRegistered(PING))
        ));
        assert!(matches!(
            server.register_handler(PONG, handler()),
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn non_reentrant_handler_runs_serially_in_arrival_order() {
        let (client, server) = dispatcher_pair();
        let active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        server
            .register_handler(
                SLOW,
                Arc::new(handler_fn({
                    let active = Arc::clone(&active);
                    let order = Arc::clone(&order);
                    move |req: Message| {
                        let active = Arc::clone(&active);
                        let order = Arc::clone(&order);
                        async move {
                            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            order.lock().unwrap().push(n_of(&req));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(None)
                        }
                    }
                })),
            )
            .unwrap();

        for n in 0..5 {
            client
                .send_fire_and_forget(Message::empty(SLOW).with_field(1, n))
                .await
                .unwrap();
        }
        // A request behind the fire-and-forget ones on the same handler.
        client
            .send_request(Message::empty(SLOW).with_field(1, 5))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn different_handlers_run_concurrently() {
        let (client, server) = dispatcher_pair();
        let gate = Arc::new(tokio::sync::Notify::new());
        server
            .register_handler(
                SLOW,
                Arc::new(handler_fn({
                    let gate = Arc::clone(&gate);
                    move |_req: Message| {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notified().await;
                            Ok(None)
                        }
                    }
                })),
            )
            .unwrap();
        server
            .register_handler(
                PING,
                Arc::new(handler_fn({
                    let gate = Arc::clone(&gate);
                    move |_req: Message| {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notify_one();
                            Ok(Some(pong(0)))
                        }
                    }
                })),
            )
            .unwrap();

        let slow = tokio::spawn({
            let client = client.clone();
            async move { client.send_request(Message::empty(SLOW)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.send_request(ping(0)).await.unwrap();
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn timeout_removes_only_its_own_entry() {
        let (client, mut peer_reader, _peer_writer) = dispatcher_and_peer();
        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.send_request(ping(1)).await }
        });
        peer_reader.next().await.unwrap().unwrap();
        assert_eq!(client.pending_requests(), 1);

        let err = client
            .send_request_with(ping(2), Some(Duration::from_millis(20)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert_eq!(client.pending_requests(), 1);
        waiting.abort();
    }

    #[tokio::test]
    async fn cancellation_resolves_cancelled() {
        let (client, _peer_reader, _peer_writer) = dispatcher_and_peer();
        let cancel = CancellationToken::new();
        let call = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.send_request_with(ping(1), None, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(call.await.unwrap(), Err(SessionError::Cancelled)));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn peer_close_fails_pending_with_channel_closed() {
        let (client, mut peer_reader, peer_writer) = dispatcher_and_peer();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send_request(ping(1)).await }
        });
        peer_reader.next().await.unwrap().unwrap();
        drop(peer_writer);
        drop(peer_reader);

        assert!(matches!(call.await.unwrap(), Err(SessionError::ChannelClosed)));
        assert_eq!(client.closed().await, SessionState::Closed);
        assert!(matches!(
            client.send_request(ping(2)).await,
            Err(SessionError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn handshake_after_negotiation_faults_session() {
        use crate::bridge::protocol::Handshake;

        let (client, mut peer_reader, mut peer_writer) = dispatcher_and_peer();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send_request(ping(1)).await }
        });
        peer_reader.next().await.unwrap().unwrap();
        peer_writer
            .send(Frame::uncorrelated(Handshake::default().to_message()))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::HandshakeViolation(_))
        ));
        assert_eq!(client.closed().await, SessionState::Faulted);
    }

    #[tokio::test]
    async fn unknown_type_faults_session() {
        use tokio::io::AsyncWriteExt;

        let registry = registry();
        let (a, b) = Channel::pair().unwrap();
        let (reader, writer) = framed(a, FrameCodec::new(Arc::clone(&registry)));
        let (state, _) = watch::channel(SessionState::Handshaking);
        let dispatcher = Dispatcher::new(registry, writer, state, None);
        dispatcher.start(reader);

        let (_, mut raw) = b.into_split();
        // length 4, type id 99, no fields
        raw.write_all(&[4, 0, 0, 0, 99, 0, 0, 0]).await.unwrap();

        assert_eq!(dispatcher.closed().await, SessionState::Faulted);
        assert!(matches!(
            dispatcher.fault(),
            Some(SessionError::Protocol(ProtocolError::UnknownTypeId(99)))
        ));
    }

    #[tokio::test]
    async fn response_for_unknown_correlation_is_ignored() {
        let (client, _peer_reader, mut peer_writer) = dispatcher_and_peer();
        peer_writer.send(Frame::new(999, pong(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, server) = dispatcher_pair();
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(server.closed().await, SessionState::Closed);
        assert!(matches!(
            client.send_fire_and_forget(ping(1)).await,
            Err(SessionError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn responses_cannot_be_sent_as_requests() {
        let (client, _server) = dispatcher_pair();
        assert!(matches!(
            client.send_request(pong(1)).await,
            Err(SessionError::Protocol(ProtocolError::InvalidMessage(_)))
        ));
    }
}
