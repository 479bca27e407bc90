//! Controller - starts test hosts and owns their sessions.
//!
//! Flow for one host:
//! 1. Bind a fresh endpoint and pass its descriptor through the environment
//! 2. Start the child through the supervisor
//! 3. Accept its connection, racing the child's early exit
//! 4. Handshake and start dispatching (data consumers, `HostExiting`)
//! 5. Notify session lifetime handlers on start and after the session ends

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{HOST_EXITING_TYPE, HostExiting};
use crate::bridge::registry::{Message, SerializerRegistry};
use crate::bridge::transport::{ChannelError, ChannelListener, EndpointName};
use crate::config::HostConfig;
use crate::dispatcher::{SessionError, SessionState, handler_fn};
use crate::extensions::broker::DataConsumerBroker;
use crate::extensions::host::{ActiveExtensions, contain};
use crate::handshake::{HostRole, PeerInfo};
use crate::session::{Session, SessionBuilder, SessionContext};
use crate::supervisor::{
    ProcessExit, ProcessStartInfo, ProcessSupervisor, SupervisedProcess, SupervisorError,
};

/// How long a session may keep draining after its process exited.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("test host exited with code {exit_code} before connecting")]
    HostExitedEarly { exit_code: i32, stderr: String },
}

/// What a finished test host left behind.
#[derive(Debug, Clone)]
pub struct TestHostExit {
    pub process: ProcessExit,
    /// Code announced through `HostExiting`, if the host sent one.
    pub reported_exit_code: Option<i32>,
    pub session_state: SessionState,
}

pub struct Controller {
    config: HostConfig,
    registry: Arc<SerializerRegistry>,
    extensions: ActiveExtensions,
    supervisor: ProcessSupervisor,
}

impl Controller {
    pub fn new(
        config: HostConfig,
        registry: Arc<SerializerRegistry>,
        extensions: ActiveExtensions,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(extensions.clone())
            .with_kill_grace_period(config.kill_grace_period);
        Self {
            config,
            registry,
            extensions,
            supervisor,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Start a test host and wait until its session is negotiated.
    ///
    /// The child is killed if it fails to connect or handshake in time.
    pub async fn spawn_test_host(
        &self,
        mut start_info: ProcessStartInfo,
        cancel: &CancellationToken,
    ) -> Result<TestHostHandle, ControllerError> {
        let listener = ChannelListener::bind(&EndpointName::generate())?;
        start_info
            .env
            .set(self.config.endpoint_env_var.clone(), listener.endpoint().to_env_value()?);
        tracing::info!(
            endpoint = %listener.endpoint(),
            program = %start_info.program.display(),
            "Starting test host"
        );

        let process = self.supervisor.start(start_info, cancel).await?;

        let channel = tokio::select! {
            accepted = listener.accept(self.config.connect_timeout, cancel) => accepted,
            exit = process.wait() => {
                tracing::warn!(exit_code = exit.exit_code, "Test host exited before connecting");
                return Err(ControllerError::HostExitedEarly {
                    exit_code: exit.exit_code,
                    stderr: exit.stderr,
                });
            }
        };
        let channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                process.kill("connect failed");
                return Err(e.into());
            }
        };
        drop(listener);

        let broker = Arc::new(DataConsumerBroker::new(&self.extensions, &self.registry));
        let reported_exit = Arc::new(OnceLock::new());

        let context = SessionContext::new(
            HostRole::Controller,
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        let mut builder = SessionBuilder::new(context).handler(
            HOST_EXITING_TYPE,
            Arc::new(handler_fn({
                let reported_exit = Arc::clone(&reported_exit);
                let broker = Arc::clone(&broker);
                move |message: Message| {
                    let reported_exit = Arc::clone(&reported_exit);
                    let broker = Arc::clone(&broker);
                    async move {
                        let exiting = message.decode::<HostExiting>()?;
                        tracing::debug!(exit_code = exiting.exit_code, "Test host announced exit");
                        let _ = reported_exit.set(exiting.exit_code);
                        broker.publish(message).await;
                        Ok(None)
                    }
                }
            })),
        );
        // HostExiting reaches its subscribers through the handler above.
        for type_id in broker.data_types() {
            if *type_id != HOST_EXITING_TYPE {
                builder = builder.handler(*type_id, Arc::clone(&broker) as _);
            }
        }

        let session = match builder.establish(channel).await {
            Ok(session) => session,
            Err(e) => {
                process.kill("handshake failed");
                broker.shutdown().await;
                return Err(e.into());
            }
        };

        for (extension, handler) in self.extensions.session_lifetime_handlers() {
            let started = handler.on_session_started(session.peer());
            contain(&extension.info, "on_session_started", started).await;
        }

        let (finished_tx, finished) = watch::channel(None);
        tokio::spawn(watch_session(
            session.clone(),
            process.clone(),
            broker,
            self.extensions.clone(),
            finished_tx,
        ));

        Ok(TestHostHandle {
            session,
            process,
            reported_exit,
            finished,
        })
    }

    /// Kill every host this controller started.
    pub fn shutdown(&self, reason: &str) {
        self.supervisor.kill_all(reason);
    }
}

/// Wait for the session to end, drain data consumers, then run the finished
/// callbacks. Closes the session if it outlives its process.
async fn watch_session(
    session: Session,
    process: SupervisedProcess,
    broker: Arc<DataConsumerBroker>,
    extensions: ActiveExtensions,
    finished: watch::Sender<Option<SessionState>>,
) {
    let state = tokio::select! {
        state = session.closed() => state,
        _ = process.wait() => {
            match tokio::time::timeout(SESSION_DRAIN_TIMEOUT, session.closed()).await {
                Ok(state) => state,
                Err(_) => {
                    tracing::debug!(session_id = %session.id(), "Session outlived its process");
                    session.close().await;
                    session.state()
                }
            }
        }
    };
    broker.shutdown().await;

    tracing::info!(session_id = %session.id(), ?state, "Session finished");
    for (extension, handler) in extensions.session_lifetime_handlers() {
        let finished = handler.on_session_finished(state);
        contain(&extension.info, "on_session_finished", finished).await;
    }
    finished.send_replace(Some(state));
}

/// A running test host and its session.
pub struct TestHostHandle {
    session: Session,
    process: SupervisedProcess,
    reported_exit: Arc<OnceLock<i32>>,
    finished: watch::Receiver<Option<SessionState>>,
}

impl std::fmt::Debug for TestHostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHostHandle")
            .field("session", &self.session.id())
            .field("pid", &self.process.pid())
            .finish()
    }
}

impl TestHostHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn process(&self) -> &SupervisedProcess {
        &self.process
    }

    pub fn peer(&self) -> &PeerInfo {
        self.session.peer()
    }

    pub fn reported_exit_code(&self) -> Option<i32> {
        self.reported_exit.get().copied()
    }

    pub fn kill(&self, reason: &str) {
        self.process.kill(reason);
    }

    /// Wait for the process to exit and the session to finish.
    pub async fn wait_for_exit(&self) -> TestHostExit {
        let process = self.process.wait().await;
        let mut finished = self.finished.clone();
        let session_state = match finished.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(SessionState::Closed),
            Err(_) => self.session.state(),
        };
        TestHostExit {
            process,
            reported_exit_code: self.reported_exit_code(),
            session_state,
        }
    }
}
