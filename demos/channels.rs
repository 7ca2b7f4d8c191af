//! Channels - calls and event subscriptions over one connection.
//!
//! This demo shows:
//! - Registering a channel with typed commands and an event
//! - Calling a command from a client
//! - Subscribing to an event and unsubscribing by dropping the subscription
//!
//! ```text
//! RUST_LOG=ipcwire=debug cargo run --example channels
//! ```

use std::time::Duration;

use ipcwire::channel::{ChannelContext, CommandChannel, IpcClient, IpcServer};
use ipcwire::event::Emitter;
use ipcwire::{generate_pipe_path, Address, Server, ServerConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Input of the `resize` command.
#[derive(Deserialize, Debug)]
struct Resize {
    width: u32,
    height: u32,
}

/// Output of the `resize` command.
#[derive(Serialize, Debug)]
struct Area {
    area: u64,
    requested_by: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let address = Address::Pipe(generate_pipe_path("channels"));
    let ipc = IpcServer::new(Server::serve(address.clone(), ServerConfig::default()).await?);

    let progress = Emitter::new();
    ipc.register_channel(
        "window",
        CommandChannel::new()
            .command("resize", |input: Resize, ctx: ChannelContext| async move {
                Ok(Area {
                    area: u64::from(input.width) * u64::from(input.height),
                    requested_by: ctx.client_id().to_string(),
                })
            })
            .event("progress", progress.event()),
    );

    let client = IpcClient::connect(&address, "window:1").await?;

    let area = client
        .call("window", "resize", &json!({"width": 800, "height": 600}))
        .await?;
    println!("resize -> {area}");

    let mut events = client.listen("window", "progress", &()).await?;
    // Give the subscription time to reach the server.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for percent in [25, 50, 100] {
        progress.fire(json!({ "percent": percent }));
    }
    for _ in 0..3 {
        if let Some(event) = events.recv().await {
            println!("progress -> {event}");
        }
    }
    drop(events);

    println!("connected peers: {:?}", ipc.connections());
    client.dispose();
    ipc.dispose();
    Ok(())
}
