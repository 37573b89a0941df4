//! Serves an NDJSON GPS feed for the tracker's live exchangers.
//!
//! Every accepted connection gets one fix per entity per tick. Point the
//! server at it with `--live-feed emitter@127.0.0.1:9100`.

use anyhow::Result;
use clap::Parser;
use lib_common::geo::{walker, Location};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = "127.0.0.1:9100")]
    listen: String,

    /// Number of simulated entities
    #[clap(short, long, default_value_t = 3)]
    entities: usize,

    /// Milliseconds between fixes
    #[clap(short, long, default_value_t = 500)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let entities: Vec<Uuid> = (0..args.entities).map(|_| Uuid::new_v4()).collect();
    for id in &entities {
        println!("entity {}", id);
    }

    let listener = TcpListener::bind(&args.listen).await?;
    println!("Feed listening on {}", args.listen);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        println!("Exchanger connected from {}", peer);
        let generators: Vec<_> = entities
            .iter()
            .map(|id| walker(*id, Location::new(37.9838, 23.7275)))
            .collect();
        let interval = Duration::from_millis(args.interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut sent = 0usize;
            loop {
                ticker.tick().await;
                for generate in &generators {
                    let mut line = match serde_json::to_string(&generate("emitter")) {
                        Ok(line) => line,
                        Err(e) => {
                            eprintln!("encode failed: {}", e);
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(e) = socket.write_all(line.as_bytes()).await {
                        println!("Exchanger {} gone after {} fixes: {}", peer, sent, e);
                        return;
                    }
                    sent += 1;
                }
            }
        });
    }
}
