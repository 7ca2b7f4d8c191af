//! Ping/Pong - one server, one client, one round trip.
//!
//! This demo shows:
//! - Serving on a freshly generated pipe address
//! - Connecting a client (its id arrives as the first message)
//! - Sending JSON one way and plain text the other
//!
//! ```text
//! RUST_LOG=ipcwire=trace cargo run --example ping_pong
//! ```

use ipcwire::{
    generate_pipe_path, Address, Client, Message, ProtocolConfig, Server, ServerConfig,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let address = Address::Pipe(generate_pipe_path("ping-pong"));
    let server = Server::serve(address.clone(), ServerConfig::default()).await?;
    println!("listening on {address}");

    let mut peers = server.on_did_client_connect().listen();
    let serving = tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            let mut inbox = peer.protocol.on_message().listen();
            tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    match message {
                        Message::Text(client_id) => println!("server: hello {client_id}"),
                        Message::Json(value) if value["cmd"] == "ping" => {
                            println!("server: got {value}");
                            peer.protocol.send_text("pong");
                        }
                        Message::Json(value) => println!("server: ignoring {value}"),
                    }
                }
            });
        }
    });

    let client = Client::connect(&address, "ping-pong-client", ProtocolConfig::default()).await?;
    let mut replies = client.protocol().on_message().listen();
    client.protocol().send_json(&json!({"cmd": "ping"}))?;

    if let Some(reply) = replies.recv().await {
        println!("client: got {reply:?}");
    }

    client.dispose();
    server.dispose();
    serving.abort();
    Ok(())
}
