use anyhow::Result;
use clap::Parser;
use controller::ControllerRuntime;
use dotenv::dotenv;
use infrastructure::ControllerConfig;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Override MQTT broker host
    #[arg(long)]
    mqtt_host: Option<String>,

    /// Override MQTT broker port
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Override MQTT client id
    #[arg(long)]
    mqtt_client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,controller=debug,application=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("rtk controller starting");
    info!(pid = std::process::id(), "process id");

    let args = Args::parse();

    let mut config = ControllerConfig::load(&args.config_dir)?;
    if let Some(host) = args.mqtt_host {
        config.mqtt.host = host;
    }
    if let Some(port) = args.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(client_id) = args.mqtt_client_id {
        config.mqtt.client_id = client_id;
    }

    info!(tenant = %config.tenant, site = %config.site, host = %config.mqtt.host, port = config.mqtt.port, "loaded configuration");

    let mut runtime = ControllerRuntime::start(config).await?;

    let shutdown_reason = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "unable to listen for shutdown signal");
            } else {
                info!("shutdown signal received");
            }
            "normal_shutdown".to_string()
        }
        trip = runtime.wait_for_storage_trip() => {
            let reason = trip.unwrap_or_else(|| "storage_failure_budget_exceeded".to_string());
            warn!(reason = %reason, "storage failure budget exceeded, shutting down");
            reason
        }
    };

    runtime.shutdown(&shutdown_reason).await;
    info!("rtk controller stopped");
    Ok(())
}
