use crate::config::{self, Config};
use crate::gate::ListGate;
use crate::health::TargetProbe;
use crate::hold::{self, HoldDuration, HoldRequest};
use crate::orchestrator::Orchestrator;
use crate::paths::Paths;
use crate::process::{StartOutcome, StopOutcome};
use crate::protocol::{self, Decision, Request, Response};
use crate::registry::Registry;
use crate::router::TrackedRouter;
use crate::sys;
use color_eyre::eyre::{WrapErr, bail};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};

struct DaemonState {
    orchestrator: Arc<Orchestrator>,
    router: Arc<TrackedRouter>,
    config_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

fn build_gate(config: &Config) -> Arc<ListGate> {
    Arc::new(ListGate::new(&config.access, &config.messages))
}

pub async fn run(paths: Paths, config_path: PathBuf) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;

    if sys::is_daemon_running(&paths) {
        bail!("daemon is already running");
    }

    let config = config::load_config(&config_path)
        .wrap_err_with(|| format!("failed to load {}", config_path.display()))?;

    sys::write_pid_file(&paths)?;

    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    let gate = build_gate(&config);
    let registry = Arc::new(Registry::new(config, Some(paths.holds_file())));
    let router = Arc::new(TrackedRouter::new());
    let probe = Arc::new(TargetProbe::new()?);
    let orchestrator = Orchestrator::new(registry, router.clone(), probe, gate);
    orchestrator.start_sweep();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(DaemonState {
        orchestrator: orchestrator.clone(),
        router,
        config_path,
        shutdown_tx,
    });

    tracing::info!(socket = %socket_path.display(), "daemon listening");
    let result = run_accept_loop(&listener, &state, shutdown_rx).await;

    tracing::info!("shutting down");
    orchestrator.shutdown().await;

    let _ = fs::remove_file(paths.socket_file());
    sys::remove_pid_file(&paths);

    result
}

async fn run_accept_loop(
    listener: &UnixListener,
    state: &Arc<DaemonState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    let signals = sys::signal_shutdown();
    tokio::pin!(signals);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &state).await {
                        tracing::warn!("connection error: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = &mut signals => {
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: UnixStream, state: &DaemonState) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(Request::Subscribe) => {
            let directives = state.router.subscribe();
            return stream_directives(&mut writer, directives, state.shutdown_tx.subscribe()).await;
        }
        Ok(request) => dispatch(request, state).await,
        Err(e) => Response::Error {
            message: format!("bad request: {e}"),
        },
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}

/// Forward router directives to one subscriber until it hangs up.
async fn stream_directives(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    mut directives: broadcast::Receiver<crate::router::Directive>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    let ready = protocol::encode_response(&Response::Success {
        message: Some("subscribed".to_string()),
    })?;
    writer.write_all(&ready).await?;

    loop {
        tokio::select! {
            received = directives.recv() => match received {
                Ok(directive) => {
                    let encoded = protocol::encode_response(&Response::Directive { directive })?;
                    if writer.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber fell behind, directives dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

fn error(message: impl ToString) -> Response {
    Response::Error {
        message: message.to_string(),
    }
}

fn success(message: impl Into<String>) -> Response {
    Response::Success {
        message: Some(message.into()),
    }
}

async fn dispatch(request: Request, state: &DaemonState) -> Response {
    let orchestrator = &state.orchestrator;
    match request {
        Request::Status => Response::BackendList {
            backends: orchestrator.status(),
        },
        Request::Start { name } => match orchestrator.start(&name).await {
            Ok(StartOutcome::Started) => success(format!("started {name}")),
            Ok(StartOutcome::AlreadyRunning) => success(format!("{name} is already running")),
            Err(e) => error(e),
        },
        Request::Stop { name } => match orchestrator.stop(&name).await {
            Ok(StopOutcome::NotRunning) => success(format!("{name} is not running")),
            Ok(StopOutcome::Exited) => success(format!("stopped {name}")),
            Ok(StopOutcome::ForceKilled) => success(format!("killed {name} after stop timeout")),
            Err(e) => error(e),
        },
        Request::Hold { name, duration } => handle_hold(orchestrator, &name, duration),
        Request::Send { name, line } => match orchestrator.send_command(&name, &line).await {
            Ok(()) => success(format!("sent to {name}")),
            Err(e) => error(e),
        },
        Request::Reload => handle_reload(state).await,
        Request::Kill => {
            let _ = state.shutdown_tx.send(true);
            success("daemon shutting down")
        }
        Request::Login { client } => match orchestrator.on_login(&client) {
            crate::gate::Access::Allowed => {
                state.router.login(&client);
                Response::Success { message: None }
            }
            crate::gate::Access::Denied { reason } => Response::Decision {
                decision: Decision::Deny {
                    reason: Some(reason),
                },
            },
        },
        Request::Connect {
            client,
            target,
            virtual_host,
        } => {
            state.router.login(&client);
            let decision = orchestrator
                .on_pre_connect(&client, target.as_deref(), virtual_host.as_deref())
                .await;
            Response::Decision { decision }
        }
        Request::Connected {
            client,
            backend,
            previous,
        } => {
            let left = state.router.connected(&client, &backend);
            let previous = previous.or(left);
            orchestrator.on_connected(&client, &backend, previous.as_deref());
            Response::Success { message: None }
        }
        Request::Disconnect { client } => {
            let backend = state.router.disconnect(&client);
            orchestrator.on_disconnect(&client, backend.as_deref());
            Response::Success { message: None }
        }
        Request::Ping { virtual_host } => Response::Ping {
            ping: orchestrator.ping(virtual_host.as_deref()),
        },
        Request::Subscribe => error("subscribe must be the only request on a connection"),
    }
}

fn handle_hold(orchestrator: &Orchestrator, name: &str, duration: Option<String>) -> Response {
    let request = match duration {
        None => HoldRequest::Set(HoldDuration::Forever),
        Some(text) => match hold::parse_hold(&text) {
            Ok(request) => request,
            Err(e) => return error(e),
        },
    };
    match request {
        HoldRequest::Set(duration) => match orchestrator.hold(name, duration) {
            Ok(()) => success(match duration {
                HoldDuration::Forever => format!("holding {name} forever"),
                HoldDuration::Seconds(_) => format!("holding {name} for {duration}"),
            }),
            Err(e) => error(e),
        },
        HoldRequest::Clear => match orchestrator.clear_hold(name) {
            Ok(true) => success(format!("hold on {name} cleared")),
            Ok(false) => success(format!("{name} had no hold")),
            Err(e) => error(e),
        },
    }
}

async fn handle_reload(state: &DaemonState) -> Response {
    let config = match config::load_config(&state.config_path) {
        Ok(config) => config,
        Err(e) => return error(format!("reload failed, keeping current config: {e}")),
    };
    let gate = build_gate(&config);
    let summary = state.orchestrator.reload(config).await;
    state.orchestrator.set_gate(gate);
    success(format!(
        "reloaded: {} added, {} removed, {} kept",
        summary.added.len(),
        summary.removed.len(),
        summary.kept.len()
    ))
}
