use crate::reconciler::ReconcileError;
use crate::session::Session;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{read_frame, write_frame, CodecError, Envelope, Packet, WORLD_HEIGHT, WORLD_WIDTH};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};

const BOT_ANIMATIONS: [&str; 4] = ["idle", "walk", "run", "wave"];
const BOT_STEP: f32 = 25.0;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub name: String,
    pub reconnect_delay: Duration,
    /// Bound on updates buffered before the snapshot; `None` is unbounded.
    pub max_pending: Option<usize>,
    /// Interval between random moves; `None` keeps the player still.
    pub bot_interval: Option<Duration>,
    pub summary_interval: Duration,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            reconnect_delay: Duration::from_secs(2),
            max_pending: Some(4096),
            bot_interval: None,
            summary_interval: Duration::from_secs(5),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The server closed the stream.
    Closed,
    /// The local user asked to quit.
    Quit,
}

enum Inbound {
    Frame(Envelope),
    Closed,
    Failed(CodecError),
}

pub struct Client {
    config: ClientConfig,
    session: Session,
    connections: u64,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let session = Session::new(config.max_pending);
        Client {
            config,
            session,
            connections: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Connects and keeps reconnecting until Ctrl+C. Each connection starts
    /// from an empty session.
    pub async fn run(&mut self) -> Result<(), ClientError> {
        loop {
            let shutdown = tokio::signal::ctrl_c();
            match self.run_connection(shutdown).await {
                Ok(ConnectionEnd::Quit) => return Ok(()),
                Ok(ConnectionEnd::Closed) => warn!("Server closed the connection"),
                Err(e) => error!("Connection lost: {}", e),
            }

            info!("Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }

    /// Runs one connection until the server closes it, an error occurs or
    /// `shutdown` resolves.
    pub async fn run_connection<F>(&mut self, shutdown: F) -> Result<ConnectionEnd, ClientError>
    where
        F: std::future::Future,
    {
        self.session = Session::new(self.config.max_pending);
        self.connections += 1;

        info!("Connecting to {}...", self.config.server);
        let stream = TcpStream::connect(&self.config.server).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();

        send_packet(
            &mut writer,
            Packet::Hello {
                name: self.config.name.clone(),
            },
        )
        .await?;

        let mut inbound = spawn_reader(read_half);

        let mut bot_interval = interval(self.config.bot_interval.unwrap_or(Duration::from_secs(3600)));
        bot_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut summary_interval = interval(self.config.summary_interval);
        summary_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(Inbound::Frame(envelope)) => self.session.handle_envelope(&envelope)?,
                    Some(Inbound::Failed(e)) => return Err(e.into()),
                    Some(Inbound::Closed) | None => return Ok(ConnectionEnd::Closed),
                },

                _ = bot_interval.tick(), if self.config.bot_interval.is_some() => {
                    for packet in self.bot_packets() {
                        send_packet(&mut writer, packet).await?;
                    }
                },

                _ = summary_interval.tick() => self.log_summary(),

                _ = &mut shutdown => {
                    if let Err(e) = send_packet(&mut writer, Packet::Leave).await {
                        debug!("Failed to send leave: {}", e);
                    }
                    return Ok(ConnectionEnd::Quit);
                },
            }
        }
    }

    /// Picks a random step for the local entity once it exists.
    fn bot_packets(&self) -> Vec<Packet> {
        let Some(local) = self.session.local_entity() else {
            return Vec::new();
        };

        let mut rng = rand::thread_rng();
        let x = (local.x + rng.gen_range(-BOT_STEP..=BOT_STEP)).clamp(0.0, WORLD_WIDTH);
        let y = (local.y + rng.gen_range(-BOT_STEP..=BOT_STEP)).clamp(0.0, WORLD_HEIGHT);

        let mut packets = vec![Packet::Move { x, y }];
        if rng.gen_bool(0.2) {
            let animation = BOT_ANIMATIONS[rng.gen_range(0..BOT_ANIMATIONS.len())];
            packets.push(Packet::Animate {
                animation: animation.to_string(),
            });
        }
        packets
    }

    fn log_summary(&self) {
        let stats = self.session.stats();
        info!(
            "Phase {:?}, {} entities, worker {:?}, {} frames ({} applied, {} replayed, {} dropped)",
            self.session.phase(),
            self.session.cache().len(),
            self.session.worker_id(),
            stats.frames,
            stats.applied,
            stats.replayed,
            stats.dropped
        );
        if let Some(local) = self.session.local_entity() {
            debug!("Local entity at ({:.1}, {:.1}) {}", local.x, local.y, local.animation);
        }
    }
}

async fn send_packet(writer: &mut OwnedWriteHalf, packet: Packet) -> Result<(), ClientError> {
    let envelope = packet.into_envelope()?;
    write_frame(writer, &envelope).await?;
    Ok(())
}

/// Reads frames on a separate task so a partially read frame is never lost
/// to a competing `select!` branch.
fn spawn_reader(mut reader: OwnedReadHalf) -> mpsc::UnboundedReceiver<Inbound> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let message = match read_frame(&mut reader).await {
                Ok(Some(envelope)) => Inbound::Frame(envelope),
                Ok(None) => Inbound::Closed,
                Err(e) => Inbound::Failed(e),
            };
            let done = !matches!(message, Inbound::Frame(_));
            if tx.send(message).is_err() || done {
                break;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::EntitySnapshot;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("127.0.0.1:8080", "ada");
        assert_eq!(config.max_pending, Some(4096));
        assert!(config.bot_interval.is_none());
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_bot_waits_for_local_entity() {
        let client = Client::new(ClientConfig::new("127.0.0.1:1", "bot"));
        assert!(client.bot_packets().is_empty());
    }

    #[test]
    fn test_bot_moves_stay_in_world() {
        let mut client = Client::new(ClientConfig::new("127.0.0.1:1", "bot"));
        client
            .session
            .handle_packet(Packet::Welcome {
                session_id: 1,
                worker_id: 0,
            })
            .unwrap();
        client
            .session
            .handle_packet(Packet::SnapshotLoad {
                entities: vec![EntitySnapshot::new(1, "bot", 0.0, WORLD_HEIGHT)],
                snapshot_revision: Some(0),
            })
            .unwrap();

        for _ in 0..50 {
            match &client.bot_packets()[0] {
                Packet::Move { x, y } => {
                    assert!(*x >= 0.0 && *x <= WORLD_WIDTH);
                    assert!(*y >= 0.0 && *y <= WORLD_HEIGHT);
                }
                other => panic!("Expected move, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = Client::new(ClientConfig::new(addr.to_string(), "ada"));
        let result = client.run_connection(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
        assert_eq!(client.connections(), 1);
    }
}
