//! Test host side: find the controller through the environment and connect.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::registry::SerializerRegistry;
use crate::bridge::transport::{ChannelError, EndpointName, connect};
use crate::config::{ConfigError, HostConfig};
use crate::dispatcher::SessionError;
use crate::handshake::HostRole;
use crate::session::{Session, SessionBuilder, SessionContext};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Read the endpoint descriptor named by `config.endpoint_env_var`.
pub fn endpoint_from_env(config: &HostConfig) -> Result<EndpointName, ClientError> {
    endpoint_from_lookup(config, |var| std::env::var(var).ok())
}

fn endpoint_from_lookup(
    config: &HostConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EndpointName, ClientError> {
    let var = &config.endpoint_env_var;
    let raw = lookup(var).ok_or_else(|| ConfigError::Missing(var.clone()))?;
    Ok(EndpointName::from_env_value(&raw)?)
}

/// Connect as a test host with no request handlers of its own.
pub async fn connect_from_env(
    config: HostConfig,
    registry: Arc<SerializerRegistry>,
) -> Result<Session, ClientError> {
    let context = SessionContext::new(HostRole::TestHost, registry, config);
    connect_with(SessionBuilder::new(context), &CancellationToken::new()).await
}

/// Connect using a prepared builder, so handlers are in place before the
/// controller can send anything.
pub async fn connect_with(
    builder: SessionBuilder,
    cancel: &CancellationToken,
) -> Result<Session, ClientError> {
    let config = &builder.context().config;
    let endpoint = endpoint_from_env(config)?;
    tracing::debug!(%endpoint, "Connecting to controller");
    let channel = connect(&endpoint, config.connect_timeout, cancel).await?;
    Ok(builder.establish(channel).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_is_a_config_error() {
        let config = HostConfig::default().with_endpoint_env_var("TESTHOST_TEST_ENDPOINT");
        let err = endpoint_from_lookup(&config, |_| None).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"environment variable TESTHOST_TEST_ENDPOINT is not set");
    }

    #[test]
    fn garbled_endpoint_is_rejected() {
        let config = HostConfig::default();
        let err = endpoint_from_lookup(&config, |_| Some("not json".into())).unwrap_err();
        assert!(matches!(err, ClientError::Channel(ChannelError::InvalidEndpoint(_))));
    }

    #[test]
    fn endpoint_is_read_from_the_configured_variable() {
        let config = HostConfig::default().with_endpoint_env_var("CUSTOM_ENDPOINT");
        let expected = EndpointName::named("/tmp/testhost.sock");
        let value = expected.to_env_value().unwrap();
        let endpoint = endpoint_from_lookup(&config, |var: &str| {
            (var == "CUSTOM_ENDPOINT").then(|| value.clone())
        })
        .unwrap();
        assert_eq!(endpoint, expected);
    }

    #[tokio::test]
    async fn connect_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = EndpointName::named(dir.path().join("absent.sock"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = connect(&endpoint, std::time::Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ConnectTimeout { .. }));
    }
}
