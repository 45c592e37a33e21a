use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use ferry::cli::{init_logging, DaemonOpts};
use ferry::logger::{Logger, NoopLogger, TextLogger};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_logging(opts.verbose);

    // Root must exist; it is canonicalized once here
    let config = opts.server_config()?;

    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(path) => Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    info!(root = %config.root.display(), bind = %config.bind, "starting ferryd");
    if config.bind.starts_with("0.0.0.0") || config.bind.starts_with("[::]") {
        warn!("binding to all interfaces; the protocol is unencrypted and unauthenticated");
    }

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down ferryd (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Failed to set Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(ferry::net_async::server::serve(config, logger))
}
