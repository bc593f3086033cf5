//! LwM2M client binary.
//!
//! # Usage
//!
//! ```bash
//! # Register directly with one server
//! lwm2m-client --endpoint dev-1 --server 1,coap://127.0.0.1:5683
//!
//! # Start from the Bootstrap Server, granting server 2 read access to /3/0
//! lwm2m-client --endpoint dev-1 --bootstrap-server coap://127.0.0.1:5693 \
//!     --access-entry /3/0,2,1
//! ```

use clap::Parser;
use lwm2m_client::{ClientConfig, ServerConfig};
use lwm2m_core::{AccessEntry, DeviceConfig};
use lwm2m_proto::Lwm2mVersion;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LwM2M client
#[derive(Parser, Debug)]
#[command(name = "lwm2m-client")]
#[command(about = "LwM2M device client")]
#[command(version)]
struct Args {
    /// Local address to bind to
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Endpoint client name
    #[arg(short, long, default_value = "lwm2m-client")]
    endpoint: String,

    /// Bootstrap Server URI
    #[arg(long)]
    bootstrap_server: Option<String>,

    /// Regular server as SSID,URI (repeatable)
    #[arg(short, long = "server")]
    servers: Vec<ServerConfig>,

    /// Access Control entry as /OID[/IID],SSID,MASK (repeatable)
    #[arg(short, long = "access-entry")]
    access_entries: Vec<AccessEntry>,

    /// LwM2M version spoken to servers (1.0 or 1.1)
    #[arg(long, default_value = "1.0")]
    lwm2m_version: Lwm2mVersion,

    /// Bound on connect and registration exchanges, in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ClientConfig {
        endpoint: args.endpoint,
        bind: args.bind,
        bootstrap_server: args.bootstrap_server,
        servers: args.servers,
        access_entries: args.access_entries,
        connect_timeout: std::time::Duration::from_secs(args.connect_timeout),
        device: DeviceConfig { version: args.lwm2m_version, ..DeviceConfig::default() },
    };

    tracing::info!("LwM2M client {} starting (LwM2M {})", config.endpoint, args.lwm2m_version);

    let client = lwm2m_client::bind(&config).await?;
    client.run().await?;

    Ok(())
}
