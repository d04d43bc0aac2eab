use crate::applier::LocalApplier;
use crate::command::{CommandError, Reply, Response};
use crate::config::RuntimeConfig;
use crate::metrics;
use crate::resp::{self, RespError};
use crate::state_machine::StateMachine;
use crate::store::{FileStore, LocalStore};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request};
use prometheus::{Encoder, TextEncoder};
use socket2::{SockRef, TcpKeepalive};
use std::fs::{self, File};
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const SNAPSHOT_FILE_NAME: &str = "snapshot";
const TCP_KEEPALIVE: Duration = Duration::from_secs(5 * 60);

/// Why the node wants its process to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A client sent SHUTDOWN.
    Shutdown,
    /// The state machine hit an error it cannot recover from.
    Fatal(String),
}

pub struct Server<S: LocalStore + 'static = FileStore> {
    config: RuntimeConfig,
    state_machine: Arc<StateMachine<S>>,
    applier: Arc<LocalApplier>,
    termination: mpsc::Sender<Termination>,
}

impl<S: LocalStore + 'static> Server<S> {
    /// Opens the state machine (restoring the configured snapshot first, if
    /// any). The receiver yields once the node asks to be terminated.
    pub fn builder(config: RuntimeConfig) -> anyhow::Result<(Self, mpsc::Receiver<Termination>)> {
        let state_machine = StateMachine::new(&config.data_dir)
            .with_context(|| format!("opening store at {}", config.data_dir))?;
        if let Some(path) = &config.restore_from {
            let file = File::open(path).with_context(|| format!("opening snapshot {}", path))?;
            let records = state_machine
                .restore(file)
                .with_context(|| format!("restoring snapshot {}", path))?;
            log::info!(
                "restored {} records from {} into {}",
                records,
                path,
                state_machine.dir().display()
            );
        }

        let (termination, rx) = mpsc::channel(1);
        let server = Server {
            config,
            state_machine: Arc::new(state_machine),
            applier: Arc::new(LocalApplier::new()),
            termination,
        };
        Ok((server, rx))
    }

    /// Starts every listener and background task. Returns the address the RESP
    /// listener is bound to.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        self.start_metrics_server()?;
        let addr = self.start_resp_server().await?;
        self.start_snapshot_task();
        Ok(addr)
    }

    pub fn stop(&mut self) {
        match self.state_machine.close() {
            Ok(()) => log::info!("server stop"),
            Err(e) => log::warn!("server stop: {}", e),
        }
    }

    async fn start_resp_server(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("binding {}", self.config.addr))?;
        let addr = listener.local_addr()?;

        let state_machine = self.state_machine.clone();
        let applier = self.applier.clone();
        let termination = self.termination.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                set_keepalive(&stream, peer);
                let connection = Connection {
                    peer,
                    state_machine: state_machine.clone(),
                    applier: applier.clone(),
                    termination: termination.clone(),
                };
                tokio::spawn(async move {
                    metrics::CONNECTION_GAUGE.inc();
                    if let Err(e) = connection.serve(stream).await {
                        log::debug!("connection {} closed: {}", peer, e);
                    }
                    metrics::CONNECTION_GAUGE.dec();
                });
            }
        });
        log::info!("resp server started on {}", addr);
        Ok(addr)
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::warn!("encoding metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(hyper::Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .with_context(|| format!("binding {}", addr))?
            .serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    fn start_snapshot_task(&self) {
        let state_machine = self.state_machine.clone();
        let applier = self.applier.clone();
        let dir = PathBuf::from(&self.config.snapshot_dir);
        let period = Duration::from_secs(self.config.snapshot_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut saved_index = 0;
            loop {
                ticker.tick().await;
                let index = applier.applied_index();
                if index == saved_index {
                    continue;
                }
                let state_machine = state_machine.clone();
                let dir = dir.clone();
                match tokio::task::spawn_blocking(move || save_snapshot(&*state_machine, &dir)).await {
                    Ok(Ok(records)) => {
                        saved_index = index;
                        metrics::SNAPSHOT_COUNTER.inc();
                        log::info!("snapshot at index {}: {} records", index, records);
                    }
                    Ok(Err(e)) => log::warn!("snapshot at index {} failed: {:#}", index, e),
                    Err(e) => log::error!("snapshot task panicked: {}", e),
                }
            }
        });
    }
}

/// Writes a snapshot of `state_machine` to `<dir>/snapshot`, replacing the
/// previous one only once the new file is complete and synced.
pub fn save_snapshot<S: LocalStore>(state_machine: &StateMachine<S>, dir: &Path) -> anyhow::Result<u64> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let records = state_machine.snapshot(BufWriter::new(tmp.as_file_mut()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(SNAPSHOT_FILE_NAME))?;
    Ok(records)
}

/// Turns on TCP keepalive for an accepted client. Failing to do so is not a
/// reason to drop the client.
fn set_keepalive(stream: &TcpStream, peer: SocketAddr) {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(TCP_KEEPALIVE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        log::warn!("could not set keepalive for {}: {}", peer, e);
    }
}

struct Connection<S: LocalStore + 'static> {
    peer: SocketAddr,
    state_machine: Arc<StateMachine<S>>,
    applier: Arc<LocalApplier>,
    termination: mpsc::Sender<Termination>,
}

impl<S: LocalStore + 'static> Connection<S> {
    async fn serve(self, stream: TcpStream) -> Result<(), RespError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut out = Vec::new();

        loop {
            let cmd = match resp::read_command(&mut reader).await {
                Ok(Some(cmd)) => cmd,
                Ok(None) => return Ok(()),
                Err(RespError::Protocol(msg)) => {
                    out.clear();
                    let reply = Reply::Error(format!("ERR Protocol error: {}", msg));
                    resp::encode_reply(&reply, &mut out);
                    write_half.write_all(&out).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let name = cmd.name();
            let start = Instant::now();
            let peer = self.peer;
            let state_machine = self.state_machine.clone();
            let applier = self.applier.clone();
            let result = tokio::task::spawn_blocking(move || {
                state_machine.command(Some(peer), &*applier, &cmd)
            })
            .await
            .unwrap_or_else(|e| Err(CommandError::Fatal(format!("command panicked: {}", e))));
            metrics::record_command(&name, start.elapsed(), result.is_err());

            let reply = match result {
                Ok(Response::Reply(reply)) => reply,
                Ok(Response::Shutdown) => {
                    write_half.write_all(b"+OK\r\n").await?;
                    write_half.shutdown().await?;
                    let _ = self.termination.send(Termination::Shutdown).await;
                    return Ok(());
                }
                // No reply: the client sees the connection drop.
                Err(e) if e.is_fatal() => {
                    log::error!("[{}] {}: {}", self.peer, name, e);
                    let _ = self.termination.send(Termination::Fatal(e.to_string())).await;
                    return Ok(());
                }
                Err(e) => Reply::Error(format!("ERR {}", e)),
            };
            out.clear();
            resp::encode_reply(&reply, &mut out);
            write_half.write_all(&out).await?;
        }
    }
}
