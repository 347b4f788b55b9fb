//! bacbridge
//!
//! Command-line front end: one-shot discover/read/write, or a long-running
//! client that serves the trend feed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacbridge::bacnet::{Device, PropertyIdentifier, PropertyKey, PropertyValue};
use bacbridge::server::create_router;
use bacbridge::{BacnetClient, BacnetConfig};

/// BACnet/IP client
#[derive(Parser, Debug)]
#[command(name = "bacbridge")]
#[command(about = "BACnet/IP discovery, read/write and trend feed", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Interface to bind to
    #[arg(long, global = true)]
    interface: Option<String>,

    /// Local UDP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Broadcast address for Who-Is
    #[arg(long, global = true)]
    broadcast: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast Who-Is and list the devices that answer
    Discover {
        /// Collection window
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Lowest device instance to ask for
        #[arg(long, requires = "high")]
        low: Option<u32>,

        /// Highest device instance to ask for
        #[arg(long, requires = "low")]
        high: Option<u32>,
    },

    /// Read one property
    Read {
        device: u32,
        object_type: String,
        instance: u32,
        /// Defaults to present-value
        property: Option<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Write one property
    Write {
        device: u32,
        object_type: String,
        instance: u32,
        property: String,
        value: String,

        /// Command priority (1-16)
        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run the client with periodic discovery and the trend feed
    Serve {
        /// Don't start the HTTP feed
        #[arg(long)]
        no_feed: bool,

        /// Feed port
        #[arg(long)]
        feed_port: Option<u16>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bacbridge=info,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Discover {
            timeout_ms,
            low,
            high,
        } => {
            let client = BacnetClient::bind(&config)?;
            let window = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.discovery_window());
            let devices = match (low, high) {
                (Some(low), Some(high)) => client.discover_range(low, high, window)?,
                _ => client.discover(window)?,
            };
            print_devices(&devices);
            Ok(())
        }
        Command::Read {
            device,
            object_type,
            instance,
            property,
            timeout_ms,
        } => {
            let property = match property {
                Some(p) => p.parse()?,
                None => PropertyIdentifier::PresentValue,
            };
            let key = PropertyKey::new(device, object_type.parse()?, instance, property);
            let client = BacnetClient::bind(&config)?;
            ensure_known(&client, device, config.discovery_window())?;

            let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(client.default_timeout());
            let value = client.read_property(&key, timeout)?;
            println!("{} = {}", key, value);
            Ok(())
        }
        Command::Write {
            device,
            object_type,
            instance,
            property,
            value,
            priority,
            timeout_ms,
        } => {
            let key = PropertyKey::new(device, object_type.parse()?, instance, property.parse()?);
            let value = PropertyValue::parse(&value);
            let client = BacnetClient::bind(&config)?;
            ensure_known(&client, device, config.discovery_window())?;

            let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(client.default_timeout());
            client.write_property(&key, value.clone(), priority, timeout)?;
            println!("{} <- {} (ok)", key, value);
            Ok(())
        }
        Command::Serve { no_feed, feed_port } => {
            let mut config = config;
            if no_feed {
                config.feed.enabled = false;
            }
            if let Some(port) = feed_port {
                config.feed.port = port;
            }

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?
                .block_on(serve(config))
        }
    }
}

/// Defaults, then file or environment, then flags
fn load_config(args: &Args) -> Result<BacnetConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = BacnetConfig::from_file(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => BacnetConfig::from_env(),
    };

    if let Some(interface) = &args.interface {
        config.interface = interface.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(broadcast) = &args.broadcast {
        config.broadcast = Some(broadcast.clone());
    }
    Ok(config)
}

/// Targeted Who-Is when the device has not been seen yet
fn ensure_known(client: &BacnetClient, device_id: u32, window: Duration) -> Result<()> {
    if client.registry().lookup(device_id).is_some() {
        return Ok(());
    }
    info!("Looking for device {}", device_id);
    client.discover_range(device_id, device_id, window)?;
    Ok(())
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices found");
        return;
    }
    for device in devices {
        println!(
            "{:>8}  {:<21}  vendor={:<5} {}",
            device.device_id,
            device.address,
            device.metadata.vendor_id,
            device.metadata.model_name.as_deref().unwrap_or("")
        );
    }
}

async fn serve(config: BacnetConfig) -> Result<()> {
    info!("Starting bacbridge v{}", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(BacnetClient::bind(&config)?);
    let window = config.discovery_window();

    // Initial discovery
    {
        let client = Arc::clone(&client);
        let devices = tokio::task::spawn_blocking(move || client.discover(window)).await??;
        info!("Initial discovery found {} devices", devices.len());
    }

    let rediscovery = (config.discovery_interval > 0).then(|| {
        tokio::spawn(rediscover(
            Arc::clone(&client),
            Duration::from_secs(config.discovery_interval),
            window,
        ))
    });

    if config.feed.enabled {
        let app = create_router(client.feed());
        let addr: SocketAddr = format!("{}:{}", config.feed.host, config.feed.port).parse()?;
        let listener = TcpListener::bind(addr).await?;

        info!("Trend feed listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        warn!("Trend feed disabled; live trending is unavailable");
        shutdown_signal().await;
    }

    if let Some(task) = rediscovery {
        task.abort();
        let _ = task.await;
    }

    // Joining the worker blocks
    tokio::task::spawn_blocking(move || client.shutdown()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Periodic Who-Is so new and moved devices show up in the feed
async fn rediscover(client: Arc<BacnetClient>, interval: Duration, window: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately and initial discovery already ran
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !client.is_running() {
            warn!("BACnet client stopped, ending periodic discovery");
            return;
        }

        let worker = Arc::clone(&client);
        match tokio::task::spawn_blocking(move || worker.discover(window)).await {
            Ok(Ok(devices)) => info!(
                "Periodic discovery: {} responded, {} known",
                devices.len(),
                client.devices().len()
            ),
            Ok(Err(e)) => error!("Periodic discovery failed: {}", e),
            Err(e) => error!("Discovery task failed: {}", e),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
