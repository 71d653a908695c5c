use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tracing::Level;

use snigate::{ConnId, EventHandler, EventParameter, Server, ServerCallbacks, ServerConfig};

/// JSON event channel served over the snigate edge server
#[derive(Parser)]
struct Args {
    /// server config file
    #[arg(short, long, default_value = "server.json")]
    config: std::path::PathBuf,
    /// hostname of the domain to register the channel on
    #[arg(short = 'n', long)]
    hostname: String,
}

struct Channel {
    messages: AtomicU64,
}

impl EventHandler for Channel {
    fn process(&self, socket: ConnId, parameter: &EventParameter, value: Value) -> bool {
        let count = self.messages.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(socket, count, uri = parameter.uri(), "event received");
        parameter.send(
            socket,
            &json!({ "echo": value, "count": count }),
        )
    }

    fn close(&self, socket: ConnId) {
        tracing::info!(socket, "channel connection closed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();
    let args = Args::parse();

    let config = ServerConfig::from_json_file(&args.config)?;
    let server = Server::create(config, ServerCallbacks::default()).await?;

    server.configure_uri_event_io(
        args.hostname.as_bytes(),
        "/events",
        Arc::new(Channel {
            messages: AtomicU64::new(0),
        }),
    )?;

    tracing::info!(
        "events up at wss://{}:{}/events",
        args.hostname,
        server.https_addr().port()
    );
    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}
