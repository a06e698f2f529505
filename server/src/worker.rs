//! Worker-mode entry point.
//!
//! A worker learns its slot and port from the process environment, binds the
//! shared port with `SO_REUSEPORT`, announces readiness on stdout and serves
//! until the supervisor sends SIGTERM.

use crate::network::{Server, ServerMessage};
use log::{info, warn};
use shared::{ENV_WORKER_HOST, ENV_WORKER_ID, ENV_WORKER_MODE, ENV_WORKER_PORT, READY_MARKER};
use std::io::Write;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::{signal, SignalKind};

pub const DEFAULT_MAX_CLIENTS: usize = 256;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("environment variable {var} is missing")]
    MissingEnv { var: &'static str },
    #[error("environment variable {var} has invalid value `{value}`")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid listen address {0}")]
    Address(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the supervisor tells a worker through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub worker_id: u32,
    pub port: u16,
    pub host: String,
}

impl WorkerEnv {
    pub fn is_worker_mode() -> bool {
        std::env::var(ENV_WORKER_MODE)
            .map(|value| value == "1")
            .unwrap_or(false)
    }

    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker_id = parse_var(&lookup, ENV_WORKER_ID)?;
        let port = parse_var(&lookup, ENV_WORKER_PORT)?;
        let host = lookup(ENV_WORKER_HOST).unwrap_or_else(|| "0.0.0.0".to_string());

        Ok(Self {
            worker_id,
            port,
            host,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, WorkerError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| WorkerError::Address(addr))
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<T, WorkerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let value = lookup(var).ok_or(WorkerError::MissingEnv { var })?;
    value
        .trim()
        .parse()
        .map_err(|_| WorkerError::InvalidEnv { var, value })
}

/// Binds a listener that shares its port with every other worker.
pub fn bind_reuse_port(addr: SocketAddr) -> Result<TcpListener, WorkerError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

pub async fn run(env: WorkerEnv, max_clients: usize) -> Result<(), WorkerError> {
    let listener = bind_reuse_port(env.listen_addr()?)?;
    info!(
        "Worker {} listening on {}",
        env.worker_id,
        listener.local_addr()?
    );

    let mut server = Server::new(listener, env.worker_id, max_clients);
    let shutdown_tx = server.shutdown_handle();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    let _ = shutdown_tx.send(ServerMessage::Shutdown);
                    break;
                }
                // The supervisor coordinates shutdown; a terminal Ctrl+C reaches
                // the whole process group and is left to it.
                _ = sigint.recv() => warn!("Ignoring SIGINT, waiting for supervisor"),
            }
        }
    });

    announce_ready()?;
    server.run().await;
    Ok(())
}

fn announce_ready() -> Result<(), WorkerError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", READY_MARKER)?;
    stdout.flush()?;
    Ok(())
}
