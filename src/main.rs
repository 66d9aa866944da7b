mod config;
mod dap_bridge;
mod error;
mod handles;
mod mi;
mod session;
mod varobj;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dap_bridge::DapBridge;
use crate::session::{DapSession, InitialAction};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the GDB executable to spawn (overrides GDB_PATH)
    #[arg(long)]
    gdb_path: Option<String>,

    /// Directory the rolling trace log is written to (overrides MI_DAP_BRIDGE_LOG_DIR)
    #[arg(long)]
    log_dir: Option<String>,

    /// Log level, as an `EnvFilter` directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Launch and debug this program immediately, instead of waiting for a
    /// DAP client to send a `launch` request
    #[arg(long, conflicts_with = "attach")]
    launch: Option<String>,

    /// Attach to this already-running process ID immediately, instead of
    /// waiting for a DAP client to send an `attach` request
    #[arg(long, conflicts_with = "launch")]
    attach: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(gdb_path) = args.gdb_path {
        config.gdb_path = gdb_path.into();
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir.into();
    }

    // The adapter speaks DAP over stdio, so logs can never share that
    // stream: they go to a rolling file instead.
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "mi-dap-bridge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    info!("starting mi-dap-bridge, gdb path: {:?}", config.gdb_path);

    let bridge = DapBridge::spawn();
    let mut session = DapSession::new(config);
    if let Some(program) = args.launch {
        session = session.with_initial_action(InitialAction::Launch { program });
    } else if let Some(process_id) = args.attach {
        session = session.with_initial_action(InitialAction::Attach { process_id });
    }
    session.run(bridge).await?;

    Ok(())
}
