//! Minimal test host used by the integration tests.
//!
//! Answers `EchoRequest`, publishes `EchoEvent` data messages on start and
//! exits when asked through `ShutdownRequest`.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use testhost::bridge::protocol::{
    ECHO_REQUEST_TYPE, EchoEvent, EchoRequest, EchoResponse, SHUTDOWN_REQUEST_TYPE,
    ShutdownRequest, register_echo_protocol,
};
use testhost::bridge::registry::{Message, SerializerRegistry, WireMessage};
use testhost::client::connect_with;
use testhost::config::HostConfig;
use testhost::dispatcher::{SessionState, handler_fn};
use testhost::handshake::HostRole;
use testhost::logging::init_tracing;
use testhost::session::{SessionBuilder, SessionContext};
use testhost::version::PROTOCOL_FAMILY;

struct Options {
    events: i32,
    exit_code: Option<i32>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: testhost-echo [--events <n>] [--exit-code <code>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --events <n>         Publish n EchoEvent messages after connecting [default: 0]");
            eprintln!("  --exit-code <code>   Exit right after connecting instead of serving");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };
    match runtime.block_on(run(options)) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        events: 0,
        exit_code: None,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--events" => {
                i += 1;
                let raw = args.get(i).ok_or("--events requires a value")?;
                options.events = raw.parse().map_err(|_| format!("invalid event count: {raw}"))?;
            }
            "--exit-code" => {
                i += 1;
                let raw = args.get(i).ok_or("--exit-code requires a value")?;
                options.exit_code = Some(raw.parse().map_err(|_| format!("invalid exit code: {raw}"))?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(options)
}

async fn run(options: Options) -> anyhow::Result<i32> {
    let config = HostConfig::from_env().context("invalid configuration")?;
    let mut registry = SerializerRegistry::new(PROTOCOL_FAMILY);
    register_echo_protocol(&mut registry)?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<i32>();
    let pid = i32::try_from(process::id()).unwrap_or_default();

    let context = SessionContext::new(HostRole::TestHost, Arc::new(registry), config);
    let builder = SessionBuilder::new(context)
        .handler(
            ECHO_REQUEST_TYPE,
            Arc::new(
                handler_fn(move |message: Message| async move {
                    let request = message.decode::<EchoRequest>()?;
                    Ok(Some(
                        EchoResponse {
                            text: request.text,
                            value: request.value,
                            pid,
                        }
                        .to_message(),
                    ))
                })
                .reentrant(),
            ),
        )
        .handler(
            SHUTDOWN_REQUEST_TYPE,
            Arc::new(handler_fn(move |message: Message| {
                let shutdown_tx = shutdown_tx.clone();
                async move {
                    let request = message.decode::<ShutdownRequest>()?;
                    shutdown_tx.send(request.exit_code)?;
                    Ok(None)
                }
            })),
        );

    let session = connect_with(builder, &CancellationToken::new())
        .await
        .context("failed to connect to controller")?;

    for sequence in 0..options.events {
        let event = EchoEvent {
            sequence,
            text: format!("event {sequence}"),
        };
        session.send_fire_and_forget(event.to_message()).await?;
    }

    let exit_code = match options.exit_code {
        Some(code) => code,
        None => tokio::select! {
            code = shutdown_rx.recv() => code.unwrap_or_default(),
            state = session.closed() => {
                tracing::info!(?state, "Controller went away");
                return Ok(if state == SessionState::Faulted { 1 } else { 0 });
            }
        },
    };

    if let Err(e) = session.notify_exiting(exit_code).await {
        tracing::warn!(error = %e, "Failed to announce exit");
    }
    session.close().await;
    Ok(exit_code)
}
