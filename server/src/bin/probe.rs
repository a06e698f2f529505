//! Opens a batch of connections to a running cluster and reports which worker
//! answered each one.

use clap::Parser;
use shared::{read_frame, write_frame, Packet};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster address
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Number of connections to open
    #[arg(short = 'n', long, default_value = "32")]
    connections: usize,
}

async fn probe_once(server: &str, index: usize) -> Result<u32, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(server).await?;

    let hello = Packet::Hello {
        name: format!("probe-{}", index),
    };
    write_frame(&mut stream, &hello.into_envelope()?).await?;

    loop {
        let envelope = timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await??
            .ok_or("connection closed before welcome")?;

        if let Packet::Welcome { worker_id, .. } = Packet::from_envelope(&envelope)? {
            write_frame(&mut stream, &Packet::Leave.into_envelope()?).await?;
            return Ok(worker_id);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut per_worker: BTreeMap<u32, usize> = BTreeMap::new();
    let mut failures = 0;

    for index in 0..args.connections {
        match probe_once(&args.server, index).await {
            Ok(worker_id) => *per_worker.entry(worker_id).or_insert(0) += 1,
            Err(e) => {
                eprintln!("Connection {} failed: {}", index, e);
                failures += 1;
            }
        }
    }

    println!("Connections per worker:");
    for (worker_id, count) in &per_worker {
        println!("  worker {}: {}", worker_id, count);
    }
    if failures > 0 {
        println!("  failed: {}", failures);
    }

    Ok(())
}
