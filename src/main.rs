//! Millrace CLI - serve a simulated document for local playback testing.
//!
//! Starts the range server over the deterministic in-process store so the
//! HTTP surface can be exercised with a real media player or curl without
//! touching the production transport.

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use millrace::remote::{SimulatedDocument, SimulatedStore};
use millrace::{CliLogLevel, MillraceConfig, StreamManager, StreamRequest, init_tracing};

#[derive(Parser)]
#[command(name = "millrace")]
#[command(about = "Loopback range server over a remote chunk store")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Size of the simulated document in MiB
    #[arg(long, default_value_t = 64)]
    size_mib: u64,

    /// MIME type served for the simulated document
    #[arg(long, default_value = "video/mp4")]
    mime_type: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    let store = Arc::new(SimulatedStore::new());
    store.insert_document(
        1,
        1,
        SimulatedDocument::new(1, cli.size_mib * 1024 * 1024, &cli.mime_type, "millrace-demo"),
    );

    let mut config = MillraceConfig::from_env();
    config.pool.credential_path = Some(std::env::temp_dir().join("millrace-demo-session.json"));

    let manager = StreamManager::new(store, config)?;
    let handle = manager
        .start_stream(StreamRequest {
            stream_id: "demo".to_string(),
            chat_id: 1,
            message_id: 1,
            api_id: 1,
            api_hash: "demo".to_string(),
            bot_token: "demo".to_string(),
            mime_type: None,
            total_size: None,
            parts: Vec::new(),
        })
        .await?;

    println!("Serving simulated stream at {}", handle.url);
    println!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    manager.shutdown().await?;
    Ok(())
}
