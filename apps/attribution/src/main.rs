use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use deeplink_attribution_service::config::Config;

#[derive(Parser, Debug)]
#[command(name = "deeplink-attribution-service")]
#[command(about = "Deferred deep-link attribution service")]
struct Args {
    /// Port to listen on; keeps the host from ATTRIBUTION_BIND_ADDR.
    #[arg(long)]
    port: Option<u16>,
    /// Full listen address; overrides ATTRIBUTION_BIND_ADDR and --port.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    deeplink_attribution_service::init_tracing(config.log_format);

    if let Some(port) = args.port {
        config.bind_addr.set_port(port);
    }
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }

    deeplink_attribution_service::serve(config).await
}
