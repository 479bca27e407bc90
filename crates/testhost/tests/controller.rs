//! End-to-end: a controller driving the `testhost-echo` binary.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use testhost::bridge::protocol::{
    ECHO_EVENT_TYPE, EchoEvent, EchoRequest, EchoResponse, HOST_EXITING_TYPE, HostExiting,
    ShutdownRequest, register_echo_protocol,
};
use testhost::bridge::registry::{Message, MessageTypeId, SerializerRegistry, WireMessage};
use testhost::extensions::points::{
    DataConsumer, Extension, ExtensionInfo, ExtensionPoint, SessionLifetimeHandler,
};
use testhost::{
    ActiveExtensions, CancellationToken, Controller, EXIT_CODE_KILLED, ExtensionHost, HostConfig,
    HostRole, PROTOCOL_FAMILY, PeerInfo, ProcessStartInfo, SessionState, TestHostHandle,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn echo_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_testhost-echo"))
}

fn registry() -> Arc<SerializerRegistry> {
    let mut registry = SerializerRegistry::new(PROTOCOL_FAMILY);
    register_echo_protocol(&mut registry).unwrap();
    Arc::new(registry)
}

fn controller(extensions: ActiveExtensions) -> Controller {
    let config = HostConfig::default()
        .with_connect_timeout(Duration::from_secs(10))
        .with_request_timeout(Some(Duration::from_secs(10)))
        .with_kill_grace_period(Duration::from_secs(1));
    Controller::new(config, registry(), extensions)
}

async fn spawn_echo(controller: &Controller, args: &[&str]) -> TestHostHandle {
    let start = ProcessStartInfo::new(echo_bin()).args(args.iter().copied());
    tokio::time::timeout(TEST_TIMEOUT, controller.spawn_test_host(start, &CancellationToken::new()))
        .await
        .expect("spawn timed out")
        .expect("spawn failed")
}

#[derive(Default)]
struct Observer {
    events: Mutex<Vec<i32>>,
    started: Mutex<Vec<Option<u32>>>,
    finished: Mutex<Vec<SessionState>>,
}

#[async_trait]
impl Extension for Observer {
    fn as_data_consumer(&self) -> Option<&dyn DataConsumer> {
        Some(self)
    }

    fn as_session_lifetime_handler(&self) -> Option<&dyn SessionLifetimeHandler> {
        Some(self)
    }
}

#[async_trait]
impl DataConsumer for Observer {
    fn data_types(&self) -> Vec<MessageTypeId> {
        vec![ECHO_EVENT_TYPE]
    }

    async fn consume(&self, message: Message) -> anyhow::Result<()> {
        let event = message.decode::<EchoEvent>()?;
        self.events.lock().unwrap().push(event.sequence);
        Ok(())
    }
}

#[async_trait]
impl SessionLifetimeHandler for Observer {
    async fn on_session_started(&self, peer: &PeerInfo) -> anyhow::Result<()> {
        self.started.lock().unwrap().push(peer.pid);
        Ok(())
    }

    async fn on_session_finished(&self, state: SessionState) -> anyhow::Result<()> {
        self.finished.lock().unwrap().push(state);
        Ok(())
    }
}

async fn observed() -> (Arc<Observer>, ActiveExtensions) {
    let observer = Arc::new(Observer::default());
    let mut host = ExtensionHost::new();
    host.register_composite(
        [ExtensionPoint::DataConsumer, ExtensionPoint::SessionLifetimeHandler],
        ExtensionInfo::new("observer", "Observer", "1.0.0"),
        {
            let observer = Arc::clone(&observer);
            move || Ok(observer as Arc<dyn Extension>)
        },
    )
    .unwrap();
    (observer, host.build_active_set().await)
}

/// Data consumer with a configurable subscription list.
struct Subscriber {
    types: Vec<MessageTypeId>,
    events: Mutex<Vec<i32>>,
    exit_codes: Mutex<Vec<i32>>,
}

#[async_trait]
impl Extension for Subscriber {
    fn as_data_consumer(&self) -> Option<&dyn DataConsumer> {
        Some(self)
    }
}

#[async_trait]
impl DataConsumer for Subscriber {
    fn data_types(&self) -> Vec<MessageTypeId> {
        self.types.clone()
    }

    async fn consume(&self, message: Message) -> anyhow::Result<()> {
        match message.type_id() {
            ECHO_EVENT_TYPE => self
                .events
                .lock()
                .unwrap()
                .push(message.decode::<EchoEvent>()?.sequence),
            HOST_EXITING_TYPE => self
                .exit_codes
                .lock()
                .unwrap()
                .push(message.decode::<HostExiting>()?.exit_code),
            other => anyhow::bail!("unexpected message type {other}"),
        }
        Ok(())
    }
}

async fn subscribed(
    subscriptions: &[(&str, Vec<MessageTypeId>)],
) -> (Vec<Arc<Subscriber>>, ActiveExtensions) {
    let mut host = ExtensionHost::new();
    let mut subscribers = Vec::new();
    for (id, types) in subscriptions {
        let subscriber = Arc::new(Subscriber {
            types: types.clone(),
            events: Mutex::new(Vec::new()),
            exit_codes: Mutex::new(Vec::new()),
        });
        subscribers.push(Arc::clone(&subscriber));
        host.register(
            ExtensionPoint::DataConsumer,
            ExtensionInfo::new(*id, *id, "1.0.0"),
            move || Ok(subscriber as Arc<dyn Extension>),
        )
        .unwrap();
    }
    (subscribers, host.build_active_set().await)
}

#[tokio::test]
async fn echo_roundtrip_and_requested_exit() {
    let controller = controller(ActiveExtensions::default());
    let host = spawn_echo(&controller, &[]).await;

    assert_eq!(host.peer().role, Some(HostRole::TestHost));
    assert_eq!(host.peer().pid, host.process().pid());

    let reply: EchoResponse = host
        .session()
        .request(&EchoRequest {
            text: "ping".into(),
            value: 4,
        })
        .await
        .unwrap();
    assert_eq!(reply.text, "ping");
    assert_eq!(reply.value, 4);
    assert_eq!(Some(reply.pid as u32), host.process().pid());

    host.session()
        .send_fire_and_forget(ShutdownRequest { exit_code: 5 }.to_message())
        .await
        .unwrap();

    let exit = tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
        .await
        .unwrap();
    assert_eq!(exit.process.exit_code, 5);
    assert_eq!(exit.reported_exit_code, Some(5));
    assert_eq!(exit.session_state, SessionState::Closed);
}

#[tokio::test]
async fn many_concurrent_requests_share_one_session() {
    let controller = controller(ActiveExtensions::default());
    let host = spawn_echo(&controller, &[]).await;

    let calls = (0..32).map(|value| {
        let session = host.session().clone();
        async move {
            let reply: EchoResponse = session
                .request(&EchoRequest {
                    text: format!("call {value}"),
                    value,
                })
                .await
                .unwrap();
            assert_eq!(reply.value, value);
            assert_eq!(reply.text, format!("call {value}"));
        }
    });
    futures::future::join_all(calls).await;

    host.kill("done");
    tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
        .await
        .unwrap();
}

#[tokio::test]
async fn data_messages_reach_consumers_before_session_finishes() {
    let (observer, extensions) = observed().await;
    let controller = controller(extensions);
    let host = spawn_echo(&controller, &["--events", "3", "--exit-code", "0"]).await;

    let exit = tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
        .await
        .unwrap();
    assert_eq!(exit.process.exit_code, 0);
    assert_eq!(exit.reported_exit_code, Some(0));

    assert_eq!(*observer.events.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*observer.started.lock().unwrap(), vec![host.process().pid()]);
    assert_eq!(*observer.finished.lock().unwrap(), vec![SessionState::Closed]);
}

#[tokio::test]
async fn killed_host_reports_killed_exit_code() {
    let (observer, extensions) = observed().await;
    let controller = controller(extensions);
    let host = spawn_echo(&controller, &[]).await;

    host.kill("test finished");
    host.kill("again");
    let exit = tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
        .await
        .unwrap();
    assert_eq!(exit.process.exit_code, EXIT_CODE_KILLED);
    assert!(exit.session_state.is_terminal());
    assert_eq!(observer.finished.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn controller_shutdown_kills_running_hosts() {
    let controller = controller(ActiveExtensions::default());
    let first = spawn_echo(&controller, &[]).await;
    let second = spawn_echo(&controller, &[]).await;
    assert_eq!(controller.supervisor().running().len(), 2);

    controller.shutdown("suite finished");
    for host in [&first, &second] {
        let exit = tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
            .await
            .unwrap();
        assert_eq!(exit.process.exit_code, EXIT_CODE_KILLED);
    }
}

#[tokio::test]
async fn bad_subscriptions_do_not_stop_the_host() {
    let (subscribers, extensions) = subscribed(&[
        ("unknown", vec![999]),
        ("exiting", vec![HOST_EXITING_TYPE, ECHO_EVENT_TYPE]),
    ])
    .await;
    let controller = controller(extensions);
    let host = spawn_echo(&controller, &["--events", "2", "--exit-code", "3"]).await;

    let exit = tokio::time::timeout(TEST_TIMEOUT, host.wait_for_exit())
        .await
        .unwrap();
    assert_eq!(exit.process.exit_code, 3);
    assert_eq!(exit.reported_exit_code, Some(3));

    let (unknown, exiting) = (&subscribers[0], &subscribers[1]);
    assert!(unknown.events.lock().unwrap().is_empty());
    assert!(unknown.exit_codes.lock().unwrap().is_empty());
    assert_eq!(*exiting.events.lock().unwrap(), vec![0, 1]);
    assert_eq!(*exiting.exit_codes.lock().unwrap(), vec![3]);
}
