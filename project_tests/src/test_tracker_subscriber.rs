//! Subscribes to the tracker as one entity and prints what arrives.

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Tracker WebSocket endpoint
    #[clap(short, long, default_value = "ws://127.0.0.1:9010/ws")]
    url: String,

    /// Entity id to subscribe as
    #[clap(short, long)]
    subscriber_id: uuid::Uuid,

    /// API key, if the server requires one
    #[clap(short, long)]
    api_key: Option<String>,

    /// Send `finish` after this many aggregates, then exit
    #[clap(short, long, default_value_t = 5)]
    finish_after: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut request = format!("{}?subscriber_id={}", args.url, args.subscriber_id).into_client_request()?;
    if let Some(key) = &args.api_key {
        request.headers_mut().insert("x-api-key", key.parse()?);
    }

    let (mut socket, _) = connect_async(request).await.context("connecting to tracker")?;
    println!("Subscribed as {}", args.subscriber_id);
    socket.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;

    let mut aggregates = 0usize;
    while let Some(msg) = socket.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                println!("Server closed the connection: {:?}", frame);
                break;
            }
            _ => continue,
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str())?;
        println!("{}", serde_json::to_string_pretty(&value)?);

        match value["type"].as_str() {
            Some("aggregate") => {
                aggregates += 1;
                if aggregates == args.finish_after {
                    socket.send(Message::Text(r#"{"type":"finish"}"#.into())).await?;
                }
            }
            Some("route_finished") => break,
            _ => {}
        }
    }

    socket.close(None).await.ok();
    println!("Received {} aggregates", aggregates);
    Ok(())
}
