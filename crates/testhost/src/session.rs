//! An established, negotiated session over one channel.
//!
//! [`SessionBuilder`] collects request handlers, runs the handshake and only
//! then starts the read loop, so no request can arrive before its handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::HostExiting;
use crate::bridge::registry::{Message, MessageTypeId, SerializerRegistry, WireMessage};
use crate::bridge::transport::Channel;
use crate::config::HostConfig;
use crate::dispatcher::{Dispatcher, RequestHandler, SessionError, SessionState, framed};
use crate::handshake::{HostRole, Negotiator, PeerInfo, local_handshake};

/// Everything one session needs; nothing is cached globally.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub execution_id: String,
    pub role: HostRole,
    pub registry: Arc<SerializerRegistry>,
    pub config: HostConfig,
    pub created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(role: HostRole, registry: Arc<SerializerRegistry>, config: HostConfig) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            session_id,
            execution_id: session_id.to_string(),
            role,
            registry,
            config,
            created_at: Utc::now(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }
}

pub struct SessionBuilder {
    context: SessionContext,
    handlers: Vec<(MessageTypeId, Arc<dyn RequestHandler>)>,
}

impl SessionBuilder {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            handlers: Vec::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn handler(mut self, type_id: MessageTypeId, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push((type_id, handler));
        self
    }

    /// Handshake over `channel`, install the handlers and start dispatching.
    /// The channel is dropped on any failure.
    pub async fn establish(self, channel: Channel) -> Result<Session, SessionError> {
        let SessionBuilder { context, handlers } = self;
        let config = &context.config;
        let family = context.registry.family().to_string();

        let codec = FrameCodec::new(Arc::clone(&context.registry))
            .with_max_frame_size(config.max_frame_size);
        let (mut reader, mut writer) = framed(channel, codec);

        let local = local_handshake(context.role, &family, &context.execution_id);
        let mut negotiator = Negotiator::new(local, config.supported_majors.clone(), family);
        let peer = negotiator
            .negotiate(&mut writer, &mut reader, config.handshake_timeout)
            .await?;

        let (state, _) = watch::channel(SessionState::Handshaking);
        let dispatcher = Dispatcher::new(
            Arc::clone(&context.registry),
            writer,
            state,
            config.request_timeout,
        );
        for (type_id, handler) in handlers {
            dispatcher.register_handler(type_id, handler)?;
        }
        dispatcher.start(reader);

        tracing::info!(
            session_id = %context.session_id,
            role = %context.role,
            peer_pid = ?peer.pid,
            peer_version = %peer.version,
            "Session established"
        );

        Ok(Session {
            context: Arc::new(context),
            peer: Arc::new(peer),
            dispatcher,
        })
    }
}

/// Cheap to clone; all clones drive the same dispatcher.
#[derive(Debug, Clone)]
pub struct Session {
    context: Arc<SessionContext>,
    peer: Arc<PeerInfo>,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.context.session_id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state()
    }

    pub async fn send_request(&self, message: Message) -> Result<Message, SessionError> {
        self.dispatcher.send_request(message).await
    }

    pub async fn request<M: WireMessage, R: WireMessage>(&self, request: &M) -> Result<R, SessionError> {
        self.dispatcher.request(request).await
    }

    pub async fn send_fire_and_forget(&self, message: Message) -> Result<(), SessionError> {
        self.dispatcher.send_fire_and_forget(message).await
    }

    /// Tell the controller this host is about to exit with `exit_code`.
    pub async fn notify_exiting(&self, exit_code: i32) -> Result<(), SessionError> {
        tracing::debug!(session_id = %self.context.session_id, exit_code, "Announcing exit");
        self.send_fire_and_forget(HostExiting { exit_code }.to_message())
            .await
    }

    pub async fn close(&self) {
        self.dispatcher.close().await;
    }

    pub async fn closed(&self) -> SessionState {
        self.dispatcher.closed().await
    }
}
