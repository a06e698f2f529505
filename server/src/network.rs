//! Worker network layer: TCP sessions feeding a single world loop

use crate::client_manager::{session_id_for, ClientManager};
use crate::world::WorldState;
use log::{debug, error, info, warn};
use shared::{read_frame, write_frame, Packet, SessionId};
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Messages sent from network tasks to the world loop
#[derive(Debug)]
pub enum ServerMessage {
    ClientConnected {
        client_id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Packet>,
    },
    PacketReceived {
        client_id: SessionId,
        packet: Packet,
    },
    ClientClosed {
        client_id: SessionId,
    },
    Shutdown,
}

/// World server run by one worker process
pub struct Server {
    listener: Option<TcpListener>,
    worker_id: u32,
    clients: ClientManager,
    world: WorldState,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub fn new(listener: TcpListener, worker_id: u32, max_clients: usize) -> Self {
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Server {
            listener: Some(listener),
            worker_id,
            clients: ClientManager::new(max_clients),
            world: WorldState::new(),
            server_tx,
            server_rx,
        }
    }

    /// Handle other tasks use to stop the loop with [`ServerMessage::Shutdown`].
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Spawns the task accepting connections and assigning session ids
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();
        let worker_id = self.worker_id;

        tokio::spawn(async move {
            let mut next_seq: u32 = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let client_id = session_id_for(worker_id, next_seq);
                        next_seq = next_seq.wrapping_add(1);

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        if !spawn_connection(stream, addr, client_id, &server_tx) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn handle_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::ClientConnected {
                client_id,
                addr,
                outbound,
            } => {
                if !self.clients.add_client(client_id, addr, outbound) {
                    warn!("Rejecting connection from {}: worker full", addr);
                }
            }
            ServerMessage::PacketReceived { client_id, packet } => {
                self.handle_packet(client_id, packet);
            }
            ServerMessage::ClientClosed { client_id } => {
                self.drop_client(client_id);
            }
            ServerMessage::Shutdown => {
                info!("Worker {} shutting down", self.worker_id);
                return false;
            }
        }
        true
    }

    /// Applies one client packet to the world and fans out the result
    fn handle_packet(&mut self, client_id: SessionId, packet: Packet) {
        match packet {
            Packet::Hello { name } => {
                if !self.clients.mark_joined(client_id, &name) {
                    debug!("Ignoring hello from client {}", client_id);
                    return;
                }

                let entity = self.world.add_entity(client_id, &name);
                let (entities, revision) = self.world.snapshot();

                self.clients.send_to(
                    client_id,
                    Packet::Welcome {
                        session_id: client_id,
                        worker_id: self.worker_id,
                    },
                );
                self.clients.send_to(
                    client_id,
                    Packet::SnapshotLoad {
                        entities,
                        snapshot_revision: Some(revision),
                    },
                );
                self.clients
                    .broadcast(&Packet::Spawn { entity }, Some(client_id));
            }

            Packet::Move { x, y } => {
                if !self.clients.is_joined(client_id) {
                    return;
                }
                if let Some((revision, x, y)) = self.world.move_entity(client_id, x, y) {
                    self.clients.broadcast(
                        &Packet::PositionUpdate {
                            entity_id: client_id,
                            x,
                            y,
                            revision: Some(revision),
                        },
                        None,
                    );
                }
            }

            Packet::Animate { animation } => {
                if !self.clients.is_joined(client_id) {
                    return;
                }
                if let Some(revision) = self.world.animate_entity(client_id, &animation) {
                    self.clients.broadcast(
                        &Packet::AnimationUpdate {
                            entity_id: client_id,
                            animation,
                            revision: Some(revision),
                        },
                        None,
                    );
                }
            }

            Packet::Leave => self.drop_client(client_id),

            other => {
                warn!(
                    "Unexpected `{}` packet from client {}",
                    other.kind(),
                    client_id
                );
            }
        }
    }

    fn drop_client(&mut self, client_id: SessionId) {
        if self.clients.remove_client(client_id).is_none() {
            return;
        }
        if self.world.remove_entity(client_id).is_some() {
            self.clients.broadcast(
                &Packet::Disconnect {
                    entity_id: client_id,
                },
                None,
            );
        }
    }

    /// Main loop: accepts connections and applies messages until shutdown
    pub async fn run(&mut self) {
        self.spawn_acceptor();
        info!("Worker {} serving", self.worker_id);

        while let Some(message) = self.server_rx.recv().await {
            if !self.handle_message(message).await {
                break;
            }
        }
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }
}

/// Splits a connection into reader and writer tasks. Returns false once the
/// world loop is gone.
fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: SessionId,
    server_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> bool {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    if server_tx
        .send(ServerMessage::ClientConnected {
            client_id,
            addr,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return false;
    }

    tokio::spawn(write_packets(client_id, write_half, outbound_rx));
    tokio::spawn(read_packets(client_id, read_half, server_tx.clone()));
    true
}

async fn read_packets(
    client_id: SessionId,
    mut reader: OwnedReadHalf,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(envelope)) => match Packet::from_envelope(&envelope) {
                Ok(packet) => {
                    if server_tx
                        .send(ServerMessage::PacketReceived { client_id, packet })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => debug!("Dropping malformed frame from client {}: {}", client_id, e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Connection to client {} failed: {}", client_id, e);
                break;
            }
        }
    }

    let _ = server_tx.send(ServerMessage::ClientClosed { client_id });
}

async fn write_packets(
    client_id: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Packet>,
) {
    while let Some(packet) = outbound_rx.recv().await {
        let result = match packet.into_envelope() {
            Ok(envelope) => write_frame(&mut writer, &envelope).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Failed to send to client {}: {}", client_id, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_server() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Server::new(listener, 3, 8)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[tokio::test]
    async fn test_hello_sends_welcome_then_snapshot() {
        let mut server = test_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = session_id_for(3, 1);
        server
            .handle_message(ServerMessage::ClientConnected {
                client_id: id,
                addr: addr(),
                outbound: tx,
            })
            .await;
        server.handle_packet(
            id,
            Packet::Hello {
                name: "ada".to_string(),
            },
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::Welcome {
                session_id: id,
                worker_id: 3
            }
        );
        match rx.try_recv().unwrap() {
            Packet::SnapshotLoad {
                entities,
                snapshot_revision,
            } => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].id, id);
                assert_eq!(snapshot_revision, Some(0));
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_moves_from_unjoined_clients_are_ignored() {
        let mut server = test_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        server
            .handle_message(ServerMessage::ClientConnected {
                client_id: 1,
                addr: addr(),
                outbound: tx,
            })
            .await;
        server.handle_packet(1, Packet::Move { x: 5.0, y: 5.0 });

        assert!(rx.try_recv().is_err());
        assert_eq!(server.world().revision(), 0);
    }

    #[tokio::test]
    async fn test_move_is_broadcast_with_revision() {
        let mut server = test_server().await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        for (id, tx) in [(1, tx1), (2, tx2)] {
            server
                .handle_message(ServerMessage::ClientConnected {
                    client_id: id,
                    addr: addr(),
                    outbound: tx,
                })
                .await;
            server.handle_packet(
                id,
                Packet::Hello {
                    name: format!("p{}", id),
                },
            );
        }
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}

        server.handle_packet(1, Packet::Move { x: 40.0, y: 50.0 });

        let expected = Packet::PositionUpdate {
            entity_id: 1,
            x: 40.0,
            y: 50.0,
            revision: Some(1),
        };
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_close_broadcasts_disconnect() {
        let mut server = test_server().await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        for (id, tx) in [(1, tx1), (2, tx2)] {
            server
                .handle_message(ServerMessage::ClientConnected {
                    client_id: id,
                    addr: addr(),
                    outbound: tx,
                })
                .await;
            server.handle_packet(
                id,
                Packet::Hello {
                    name: format!("p{}", id),
                },
            );
        }
        while rx1.try_recv().is_ok() {}

        server
            .handle_message(ServerMessage::ClientClosed { client_id: 2 })
            .await;

        assert_eq!(rx1.try_recv().unwrap(), Packet::Disconnect { entity_id: 2 });
        assert_eq!(server.world().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_message_stops_loop() {
        let mut server = test_server().await;
        assert!(!server.handle_message(ServerMessage::Shutdown).await);
    }
}
