//! testhost: IPC protocol and process orchestration for out-of-process test hosts.

pub mod bridge;
pub mod client;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod extensions;
pub mod handshake;
pub mod logging;
pub mod session;
pub mod supervisor;
pub mod version;

pub use client::{ClientError, connect_from_env, connect_with};
pub use config::{ConfigError, HostConfig};
pub use controller::{Controller, ControllerError, TestHostExit, TestHostHandle};
pub use dispatcher::{Dispatcher, RequestHandler, SessionError, SessionState, handler_fn};
pub use extensions::{ActiveExtensions, ExtensionHost, ExtensionPoint};
pub use handshake::{HostRole, PeerInfo};
pub use session::{Session, SessionBuilder, SessionContext};
pub use supervisor::{
    EXIT_CODE_KILLED, EXIT_CODE_SPAWN_FAILED, ProcessStartInfo, ProcessSupervisor,
    SupervisedProcess, SupervisorError,
};
pub use tokio_util::sync::CancellationToken;
pub use version::{PROTOCOL_FAMILY, PROTOCOL_VERSION, TESTHOST_VERSION};
