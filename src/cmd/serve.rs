//! Deploy server command: `hostdeck serve`.

use anyhow::Result;

use hostdeck::config::HostdeckConfig;
use hostdeck::deploy::server::{ServerOptions, start_server};

pub async fn cmd_serve(
    config: HostdeckConfig,
    host: Option<String>,
    port: Option<u16>,
    open: bool,
    dev: bool,
) -> Result<()> {
    let mut options = ServerOptions::from_config(&config);
    if let Some(host) = host {
        options.host = host;
    }
    if let Some(port) = port {
        options.port = port;
    }
    options.dev_mode = dev;
    // No browser inside dev containers.
    options.open_browser = open && !dev;

    start_server(config, options).await
}
