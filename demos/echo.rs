use std::sync::Arc;

use clap::Parser;
use tracing::Level;

use snigate::frame::{OpCode, WsFrame};
use snigate::{Server, ServerCallbacks, ServerConfig, WebsocketConfig};

/// websocket echo served over the snigate edge server
#[derive(Parser)]
struct Args {
    /// server config file
    #[arg(short, long, default_value = "server.json")]
    config: std::path::PathBuf,
    /// hostname of the domain to register the echo uri on
    #[arg(short = 'n', long)]
    hostname: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();
    let args = Args::parse();

    let config = ServerConfig::from_json_file(&args.config)?;
    let server = Server::create(config, ServerCallbacks::default()).await?;

    let echo = server.clone();
    server.configure_websocket_callback(
        args.hostname.as_bytes(),
        Some("/echo"),
        WebsocketConfig {
            assembled: Some(Arc::new(move |socket, _domain, _uri, content, text| {
                let opcode = if text { OpCode::Text } else { OpCode::Binary };
                let frame = WsFrame::data(echo.config().websocket, opcode, true, content);
                echo.send_secure(socket, frame.into_buffer())
            })),
            ..WebsocketConfig::default()
        },
    )?;

    tracing::info!(
        "echo up at wss://{}:{}/echo",
        args.hostname,
        server.https_addr().port()
    );
    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}
