//! Extension points a registration can serve.

use std::fmt;

use async_trait::async_trait;

use crate::bridge::registry::{Message, MessageTypeId};
use crate::dispatcher::SessionState;
use crate::handshake::PeerInfo;
use crate::supervisor::{EnvironmentOverrides, ProcessExit, ProcessInfo, ProcessStartInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionPoint {
    DataConsumer,
    SessionLifetimeHandler,
    ProcessLifetimeHandler,
    EnvironmentProvider,
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DataConsumer => "data-consumer",
            Self::SessionLifetimeHandler => "session-lifetime-handler",
            Self::ProcessLifetimeHandler => "process-lifetime-handler",
            Self::EnvironmentProvider => "environment-provider",
        };
        f.write_str(name)
    }
}

/// Registration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
}

impl ExtensionInfo {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// An extension instance. One type may serve several points (a composite);
/// each `as_*` accessor exposes the capability for one point.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Evaluated once per instance; errors count as disabled.
    async fn is_enabled(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn as_data_consumer(&self) -> Option<&dyn DataConsumer> {
        None
    }

    fn as_session_lifetime_handler(&self) -> Option<&dyn SessionLifetimeHandler> {
        None
    }

    fn as_process_lifetime_handler(&self) -> Option<&dyn ProcessLifetimeHandler> {
        None
    }

    fn as_environment_provider(&self) -> Option<&dyn EnvironmentProvider> {
        None
    }
}

impl dyn Extension {
    pub fn supports(&self, point: ExtensionPoint) -> bool {
        match point {
            ExtensionPoint::DataConsumer => self.as_data_consumer().is_some(),
            ExtensionPoint::SessionLifetimeHandler => self.as_session_lifetime_handler().is_some(),
            ExtensionPoint::ProcessLifetimeHandler => self.as_process_lifetime_handler().is_some(),
            ExtensionPoint::EnvironmentProvider => self.as_environment_provider().is_some(),
        }
    }
}

/// Receives data messages published by test hosts.
#[async_trait]
pub trait DataConsumer: Send + Sync {
    fn data_types(&self) -> Vec<MessageTypeId>;

    async fn consume(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SessionLifetimeHandler: Send + Sync {
    async fn on_session_started(&self, _peer: &PeerInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_finished(&self, _state: SessionState) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ProcessLifetimeHandler: Send + Sync {
    /// An `Invalid` result vetoes the spawn.
    async fn before_start(&self, _start_info: &ProcessStartInfo) -> anyhow::Result<ValidationResult> {
        Ok(ValidationResult::Valid)
    }

    async fn on_started(&self, _process: &ProcessInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_exited(&self, _exit: &ProcessExit) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn update_environment(&self, env: &mut EnvironmentOverrides) -> anyhow::Result<()>;

    async fn validate_environment(&self, _env: &EnvironmentOverrides) -> anyhow::Result<ValidationResult> {
        Ok(ValidationResult::Valid)
    }
}
