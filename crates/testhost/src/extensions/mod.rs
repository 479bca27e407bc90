//! Extension/capability host.
//!
//! - **points**: extension point traits and metadata
//! - **host**: lazy registrations, enablement memo, active set
//! - **broker**: data consumer fan-out

pub mod broker;
pub mod host;
pub mod points;

pub use broker::DataConsumerBroker;
pub use host::{ActiveExtension, ActiveExtensions, ExtensionError, ExtensionHost, ExtensionRegistration};
pub use points::{
    DataConsumer, EnvironmentProvider, Extension, ExtensionInfo, ExtensionPoint,
    ProcessLifetimeHandler, SessionLifetimeHandler, ValidationResult,
};
