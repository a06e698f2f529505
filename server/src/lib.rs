//! # Worker Cluster Server
//!
//! This library holds both sides of the server process:
//!
//! ## Supervisor (`supervisor`, `slot`)
//! The supervisor keeps a fixed pool of worker processes alive, all bound to
//! the same TCP port through `SO_REUSEPORT` so the kernel spreads incoming
//! connections across them. It:
//! - spawns workers one by one with a short stagger
//! - forwards worker output into its own log, prefixed with the slot id
//! - restarts crashed workers within a time-windowed restart budget
//! - on SIGTERM/SIGINT asks every worker to stop and kills the ones that
//!   do not exit within the force-kill timeout
//!
//! Restart bookkeeping lives in [`slot::WorkerSlot::on_exit`] and does not
//! touch any process, so the policy is testable on its own.
//!
//! ## Worker (`worker`, `network`, `client_manager`, `world`)
//! A worker is the same binary started with `WORKER_MODE=1`. It owns the
//! authoritative world for the clients the kernel routed to it, stamps every
//! movement and animation change with a revision and broadcasts it. New
//! clients get a `welcome` and a `snapshot-load` carrying the latest revision
//! so they can reconcile updates that raced the snapshot.
//!
//! Workers share nothing but the listening port. Each one runs a single event
//! loop; connection tasks talk to it over a channel.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::supervisor::{Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let program = std::env::current_exe()?;
//!     let mut supervisor = Supervisor::new(SupervisorConfig::new(program, 8080));
//!
//!     supervisor.start().await?;
//!     // Runs until SIGTERM or SIGINT, then stops every worker.
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;
pub mod slot;
pub mod supervisor;
pub mod worker;
pub mod world;
