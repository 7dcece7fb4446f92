//! Engine daemon: starts the core and serves the admin channels until
//! interrupted.

#![deny(unsafe_code)]

use fsgate_core::config::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), control::StartError> {
    fsgate_core::logging::init();
    let config = Config::from_env();
    let mut handle = control::start(config).await?;
    info!(control = %handle.control_addr(), monitor = %handle.monitor_addr(), "serving");

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, tearing down");
    if handle.shutdown().await.is_err() {
        // The process is going away regardless; the flag only guards
        // admin-driven unloads.
        warn!("unload was not made acceptable; exiting anyway");
    }
    Ok(())
}
