//! Cluster supervisor: keeps N worker processes alive on one shared port.
//!
//! The supervisor owns the [`WorkerRegistry`] and is the only code that
//! mutates it. Spawning, output forwarding, exit waits and timers run as
//! independent tasks that report back over a single event channel, and the
//! supervisor loop applies those events one at a time.

use crate::slot::{ExitDecision, RestartPolicy, WorkerRegistry, WorkerSlot, WorkerStats};
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use shared::{ENV_WORKER_HOST, ENV_WORKER_ID, ENV_WORKER_MODE, ENV_WORKER_PORT, READY_MARKER};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Worker count when none is configured: one per core, minus the core kept
/// for the ingress process, never below one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable started for every slot, usually the supervisor binary itself.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub worker_count: Option<usize>,
    pub base_port: u16,
    pub host: String,
    pub policy: RestartPolicy,
    pub restart_delay: Duration,
    pub readiness_timeout: Duration,
    pub force_kill_timeout: Duration,
    pub stagger: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>, base_port: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            worker_count: None,
            base_port,
            host: "0.0.0.0".to_string(),
            policy: RestartPolicy::default(),
            restart_delay: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(1),
            force_kill_timeout: Duration::from_secs(5),
            stagger: Duration::from_millis(50),
        }
    }

    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .filter(|count| *count > 0)
            .unwrap_or_else(default_worker_count)
    }
}

/// Events reported to the supervisor loop by its helper tasks.
#[derive(Debug)]
pub enum SupervisorEvent {
    Exited {
        id: usize,
        generation: u64,
        code: Option<i32>,
    },
    Ready {
        id: usize,
        generation: u64,
    },
    ReadinessTimeout {
        id: usize,
        generation: u64,
    },
    Respawn {
        id: usize,
    },
}

struct ChildHandle {
    terminate: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self, SupervisorError> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).map_err(SupervisorError::Signals)?,
            sigint: signal(SignalKind::interrupt()).map_err(SupervisorError::Signals)?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM"),
            _ = self.sigint.recv() => info!("Received SIGINT"),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    registry: WorkerRegistry,
    children: HashMap<usize, ChildHandle>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    signals: Option<ShutdownSignals>,
    started: bool,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            registry: WorkerRegistry::new(),
            children: HashMap::new(),
            events_tx,
            events_rx,
            signals: None,
            started: false,
            shutting_down: false,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.registry.stats()
    }

    pub fn slot(&self, id: usize) -> Option<&WorkerSlot> {
        self.registry.get(id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.registry.iter()
    }

    /// Installs the SIGTERM/SIGINT handlers and spawns every slot in turn,
    /// pausing `stagger` between spawns. Returns the number of slots.
    pub async fn start(&mut self) -> Result<usize, SupervisorError> {
        if self.started {
            return Err(SupervisorError::AlreadyStarted);
        }
        self.started = true;
        self.signals = Some(ShutdownSignals::install()?);

        let count = self.config.resolved_worker_count();
        info!(
            "Starting {} workers on port {} (max {} restarts per {:?})",
            count, self.config.base_port, self.config.policy.max_restarts,
            self.config.policy.restart_window
        );

        for id in 0..count {
            if id > 0 && !self.config.stagger.is_zero() {
                sleep(self.config.stagger).await;
            }
            self.registry
                .insert(WorkerSlot::new(id, self.config.base_port, Instant::now()));
            self.spawn_worker(id);
        }

        Ok(count)
    }

    /// Runs until SIGTERM or SIGINT, then shuts every worker down.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let mut signals = match self.signals.take() {
            Some(signals) => signals,
            None => ShutdownSignals::install()?,
        };

        self.run_until(async move { signals.recv().await }).await;
        Ok(())
    }

    /// Processes events until `stop` resolves, then shuts down.
    pub async fn run_until<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        self.drive_until(stop).await;
        self.shutdown().await;
    }

    /// Processes events until `stop` resolves, leaving workers running.
    pub async fn drive_until<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
    }

    /// Sends SIGTERM to every live worker and waits for all of them,
    /// escalating to SIGKILL per worker after `force_kill_timeout`.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        info!("Shutting down {} workers", self.children.len());

        let mut monitors = Vec::with_capacity(self.children.len());
        for (id, mut handle) in self.children.drain() {
            if let Some(terminate) = handle.terminate.take() {
                // The monitor may already be gone if the worker exited on its own.
                let _ = terminate.send(());
            }
            monitors.push((id, handle.monitor));
        }

        for (id, monitor) in monitors {
            if let Err(e) = monitor.await {
                error!("Monitor task for worker {} failed: {}", id, e);
            }
        }

        for slot in self.registry.iter_mut() {
            slot.stop();
        }

        info!("All workers stopped");
    }

    fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Exited {
                id,
                generation,
                code,
            } => self.handle_exit(id, generation, code),
            SupervisorEvent::Ready { id, generation } => {
                if let Some(slot) = self.registry.get_mut(id) {
                    if slot.mark_running(generation) {
                        info!("Worker {} ready (pid {:?})", id, slot.pid);
                    }
                }
            }
            SupervisorEvent::ReadinessTimeout { id, generation } => {
                if let Some(slot) = self.registry.get_mut(id) {
                    if slot.mark_running(generation) {
                        warn!(
                            "Worker {} sent no readiness signal within {:?}, assuming it is running",
                            id, self.config.readiness_timeout
                        );
                    }
                }
            }
            SupervisorEvent::Respawn { id } => {
                if !self.shutting_down {
                    self.spawn_worker(id);
                }
            }
        }
    }

    fn handle_exit(&mut self, id: usize, generation: u64, code: Option<i32>) {
        if self.shutting_down {
            return;
        }

        let Some(slot) = self.registry.get_mut(id) else {
            return;
        };

        if slot.generation != generation {
            debug!(
                "Ignoring exit of stale worker {} generation {} (current {})",
                id, generation, slot.generation
            );
            return;
        }

        self.children.remove(&id);

        match slot.on_exit(Instant::now(), &self.config.policy) {
            ExitDecision::Restart { attempt } => {
                warn!(
                    "Worker {} exited with code {:?}, restarting in {:?} (attempt {}/{})",
                    id, code, self.config.restart_delay, attempt, self.config.policy.max_restarts
                );

                let events_tx = self.events_tx.clone();
                let delay = self.config.restart_delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = events_tx.send(SupervisorEvent::Respawn { id });
                });
            }
            ExitDecision::GiveUp { restarts } => {
                error!(
                    "Worker {} exited with code {:?} after {} restarts within {:?}, giving up on this slot",
                    id, code, restarts, self.config.policy.restart_window
                );
            }
        }
    }

    fn spawn_worker(&mut self, id: usize) {
        let Some(slot) = self.registry.get_mut(id) else {
            return;
        };
        let generation = slot.begin_spawn();

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(ENV_WORKER_ID, id.to_string())
            .env(ENV_WORKER_PORT, slot.port.to_string())
            .env(ENV_WORKER_HOST, &self.config.host)
            .env(ENV_WORKER_MODE, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Failed to spawn worker {} ({}): {}",
                    id,
                    self.config.program.display(),
                    e
                );
                let _ = self.events_tx.send(SupervisorEvent::Exited {
                    id,
                    generation,
                    code: None,
                });
                return;
            }
        };

        slot.pid = child.id();
        info!(
            "Spawned worker {} (pid {:?}, generation {})",
            id, slot.pid, generation
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(id, generation, stdout, Some(self.events_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(id, generation, stderr, None);
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(
            id,
            generation,
            child,
            terminate_rx,
            self.config.force_kill_timeout,
            self.events_tx.clone(),
        ));
        self.children.insert(
            id,
            ChildHandle {
                terminate: Some(terminate_tx),
                monitor,
            },
        );

        let events_tx = self.events_tx.clone();
        let readiness_timeout = self.config.readiness_timeout;
        tokio::spawn(async move {
            sleep(readiness_timeout).await;
            let _ = events_tx.send(SupervisorEvent::ReadinessTimeout { id, generation });
        });
    }
}

/// Re-emits each line of a worker stream through the supervisor log. Lines
/// on stdout equal to [`READY_MARKER`] are turned into readiness events.
fn forward_output<R>(
    id: usize,
    generation: u64,
    stream: R,
    ready_tx: Option<mpsc::UnboundedSender<SupervisorEvent>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match &ready_tx {
                    Some(tx) if line.trim() == READY_MARKER => {
                        let _ = tx.send(SupervisorEvent::Ready { id, generation });
                    }
                    Some(_) => info!("[worker {}] {}", id, line),
                    None => warn!("[worker {}] {}", id, line),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!("Output of worker {} closed: {}", id, e);
                    break;
                }
            }
        }
    });
}

/// Owns the child process until it exits, then reports the exit.
async fn monitor_child(
    id: usize,
    generation: u64,
    mut child: Child,
    terminate: oneshot::Receiver<()>,
    force_kill_timeout: Duration,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Failed to wait for worker {}: {}", id, e);
                None
            }
        },
        _ = terminate => terminate_child(id, &mut child, force_kill_timeout).await,
    };

    let _ = events_tx.send(SupervisorEvent::Exited {
        id,
        generation,
        code,
    });
}

async fn terminate_child(id: usize, child: &mut Child, force_kill_timeout: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to worker {}: {}", id, e);
        }
    }

    match tokio::time::timeout(force_kill_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!("Worker {} exited gracefully", id);
            status.code()
        }
        Ok(Err(e)) => {
            error!("Failed to wait for worker {}: {}", id, e);
            None
        }
        Err(_) => {
            warn!(
                "Worker {} still alive after {:?}, sending SIGKILL",
                id, force_kill_timeout
            );
            if let Err(e) = child.kill().await {
                error!("Failed to kill worker {}: {}", id, e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::WorkerStatus;

    fn shell_config(script: &str, workers: usize) -> SupervisorConfig {
        let mut config = SupervisorConfig::new("sh", 0);
        config.args = vec!["-c".to_string(), script.to_string()];
        config.worker_count = Some(workers);
        config.stagger = Duration::from_millis(5);
        config.restart_delay = Duration::from_millis(10);
        config.readiness_timeout = Duration::from_millis(500);
        config.force_kill_timeout = Duration::from_millis(300);
        config
    }

    #[test]
    fn test_default_worker_count_is_at_least_one() {
        assert!(default_worker_count() >= 1);
    }

    #[test]
    fn test_resolved_worker_count() {
        let mut config = SupervisorConfig::new("worker", 8080);
        config.worker_count = Some(3);
        assert_eq!(config.resolved_worker_count(), 3);

        config.worker_count = Some(0);
        assert_eq!(config.resolved_worker_count(), default_worker_count());

        config.worker_count = None;
        assert_eq!(config.resolved_worker_count(), default_worker_count());
    }

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::new("worker", 8080);
        assert_eq!(config.policy, RestartPolicy::default());
        assert_eq!(config.readiness_timeout, Duration::from_secs(1));
        assert_eq!(config.force_kill_timeout, Duration::from_secs(5));
        assert_eq!(config.host, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_readiness_marker_marks_running() {
        let script = format!("echo {}; exec sleep 30", READY_MARKER);
        let mut config = shell_config(&script, 2);
        config.readiness_timeout = Duration::from_secs(30);
        let mut supervisor = Supervisor::new(config);

        assert_eq!(supervisor.start().await.unwrap(), 2);
        supervisor.drive_until(sleep(Duration::from_millis(500))).await;

        let stats = supervisor.stats();
        assert_eq!(stats.running, 2);
        assert!(supervisor.slots().all(|slot| slot.pid.is_some()));

        supervisor.shutdown().await;
        assert_eq!(supervisor.stats().stopped, 2);
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_a_fallback() {
        let mut config = shell_config("exec sleep 30", 1);
        config.readiness_timeout = Duration::from_millis(50);
        let mut supervisor = Supervisor::new(config);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.slot(0).unwrap().status, WorkerStatus::Starting);

        supervisor.drive_until(sleep(Duration::from_millis(300))).await;
        assert_eq!(supervisor.slot(0).unwrap().status, WorkerStatus::Running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut supervisor = Supervisor::new(shell_config("exec sleep 30", 1));
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyStarted)
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_tracked_per_slot() {
        let mut config = SupervisorConfig::new("/nonexistent/worker-binary", 0);
        config.worker_count = Some(2);
        config.stagger = Duration::ZERO;
        config.restart_delay = Duration::from_millis(5);
        config.policy.max_restarts = 2;
        let mut supervisor = Supervisor::new(config);

        assert_eq!(supervisor.start().await.unwrap(), 2);
        supervisor.drive_until(sleep(Duration::from_millis(300))).await;

        let stats = supervisor.stats();
        assert_eq!(stats.crashed, 2);
        assert_eq!(stats.total_restarts, 4);
        for slot in supervisor.slots() {
            assert_eq!(slot.restart_count, 2);
            assert_eq!(slot.generation, 3);
        }

        supervisor.shutdown().await;
        assert_eq!(supervisor.stats().stopped, 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut supervisor = Supervisor::new(shell_config("exec sleep 30", 1));
        supervisor.start().await.unwrap();

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.stats().stopped, 1);
    }
}
