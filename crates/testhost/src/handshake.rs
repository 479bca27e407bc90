//! Capability negotiation run before any request is dispatched.
//!
//! Both peers send a `Handshake` property bag as their first frame and then
//! expect the other's bag as the first inbound frame. The peer's protocol
//! family must match and its major version must fall in the local range.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::bridge::codec::Frame;
use crate::bridge::error::ProtocolError;
use crate::bridge::protocol::{HANDSHAKE_TYPE, Handshake, handshake_keys};
use crate::bridge::registry::WireMessage;
use crate::dispatcher::SessionError;
use crate::version::{PROTOCOL_VERSION, ProtocolVersion, TESTHOST_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    SentHello,
    AwaitingPeerHello,
    Negotiated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostRole {
    Controller,
    TestHost,
}

impl HostRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::TestHost => "testhost",
        }
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "testhost" => Ok(Self::TestHost),
            other => Err(ProtocolError::HandshakeViolation(format!("unknown host role '{other}'"))),
        }
    }
}

/// The bag this process advertises.
pub fn local_handshake(role: HostRole, family: &str, execution_id: &str) -> Handshake {
    Handshake::default()
        .with(handshake_keys::PROCESS_ID, std::process::id().to_string())
        .with(handshake_keys::PROTOCOL_VERSION, PROTOCOL_VERSION.to_string())
        .with(handshake_keys::PROTOCOL_FAMILY, family)
        .with(handshake_keys::HOST_ROLE, role.as_str())
        .with(handshake_keys::OPERATING_SYSTEM, std::env::consts::OS)
        .with(handshake_keys::ARCHITECTURE, std::env::consts::ARCH)
        .with(handshake_keys::EXECUTION_ID, execution_id)
        .with(handshake_keys::RUNTIME_VERSION, TESTHOST_VERSION)
}

/// Typed view over a peer's negotiated bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub properties: Handshake,
    pub version: ProtocolVersion,
    pub role: Option<HostRole>,
    pub pid: Option<u32>,
}

impl PeerInfo {
    pub fn execution_id(&self) -> Option<&str> {
        self.properties.get(handshake_keys::EXECUTION_ID)
    }

    pub fn runtime_version(&self) -> Option<&str> {
        self.properties.get(handshake_keys::RUNTIME_VERSION)
    }
}

pub struct Negotiator {
    local: Handshake,
    supported_majors: RangeInclusive<u16>,
    family: String,
    state: HandshakeState,
}

impl Negotiator {
    pub fn new(local: Handshake, supported_majors: RangeInclusive<u16>, family: impl Into<String>) -> Self {
        Self {
            local,
            supported_majors,
            family: family.into(),
            state: HandshakeState::Initial,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Check a peer bag against the local family and version range.
    pub fn validate(&self, peer: &Handshake) -> Result<PeerInfo, ProtocolError> {
        let local_version = format!("{}/{}", self.family, PROTOCOL_VERSION);
        let peer_family = peer.get(handshake_keys::PROTOCOL_FAMILY).unwrap_or("<none>");
        let peer_version_raw = peer.get(handshake_keys::PROTOCOL_VERSION).unwrap_or("<none>");
        let incompatible = || ProtocolError::IncompatibleProtocolVersion {
            local: local_version.clone(),
            peer: format!("{peer_family}/{peer_version_raw}"),
        };

        if peer_family != self.family {
            return Err(incompatible());
        }
        let version: ProtocolVersion = peer_version_raw.parse().map_err(|_| incompatible())?;
        if !self.supported_majors.contains(&version.major) {
            return Err(incompatible());
        }
        let role = peer
            .get(handshake_keys::HOST_ROLE)
            .map(HostRole::from_str)
            .transpose()?;
        let pid = peer
            .get(handshake_keys::PROCESS_ID)
            .and_then(|raw| raw.parse().ok());

        Ok(PeerInfo {
            properties: peer.clone(),
            version,
            role,
            pid,
        })
    }

    /// Exchange hellos over the framed halves. On failure the caller must
    /// tear the channel down.
    pub async fn negotiate<W, R>(
        &mut self,
        writer: &mut W,
        reader: &mut R,
        timeout: Duration,
    ) -> Result<PeerInfo, SessionError>
    where
        W: Sink<Frame, Error = ProtocolError> + Unpin,
        R: Stream<Item = Result<Frame, ProtocolError>> + Unpin,
    {
        let result = match tokio::time::timeout(timeout, self.exchange(writer, reader)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };
        match &result {
            Ok(peer) => {
                self.state = HandshakeState::Negotiated;
                tracing::debug!(
                    peer_pid = ?peer.pid,
                    peer_role = ?peer.role,
                    peer_version = %peer.version,
                    "Handshake negotiated"
                );
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                tracing::warn!(error = %e, "Handshake failed");
            }
        }
        result
    }

    async fn exchange<W, R>(&mut self, writer: &mut W, reader: &mut R) -> Result<PeerInfo, SessionError>
    where
        W: Sink<Frame, Error = ProtocolError> + Unpin,
        R: Stream<Item = Result<Frame, ProtocolError>> + Unpin,
    {
        writer
            .send(Frame::uncorrelated(self.local.to_message()))
            .await?;
        self.state = HandshakeState::SentHello;
        tracing::trace!(family = %self.family, "Hello sent");

        self.state = HandshakeState::AwaitingPeerHello;

        let frame = match reader.next().await {
            Some(frame) => frame?,
            None => return Err(SessionError::ChannelClosed),
        };
        if frame.message.type_id() != HANDSHAKE_TYPE {
            return Err(ProtocolError::HandshakeViolation(format!(
                "expected handshake, got message type {}",
                frame.message.type_id()
            ))
            .into());
        }
        let peer = Handshake::from_message(&frame.message)?;
        Ok(self.validate(&peer)?)
    }
}
