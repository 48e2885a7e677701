use shelly_pvinverter_bridge::{
    BridgeConfig, MappingConfig, ModbusBus, Publisher, Scheduler, SchedulerSettings,
    ServiceSchema, ShellyClient,
};
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 2;
const EXIT_BUS_ATTACH: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Shelly PV-inverter bridge");

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let client = match ShellyClient::new(&config) {
        Ok(client) => client,
        Err(err) => {
            error!("Cannot build HTTP client: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(
        url = client.status_url(),
        product = config.generation.product_name(),
        phase = %config.phase,
        "Polling device"
    );

    let mut publisher = Publisher::new(
        ModbusBus::new(config.modbus_listen),
        ServiceSchema::pv_inverter(&config),
    );
    if let Err(err) = publisher.register() {
        error!("Cannot attach to the bus: {err}");
        return ExitCode::from(EXIT_BUS_ATTACH);
    }

    let mut scheduler = Scheduler::new(
        client,
        publisher,
        MappingConfig::from_config(&config),
        SchedulerSettings::from_config(&config),
    );
    scheduler.run(shutdown_signal()).await;

    scheduler.publisher_mut().bus_mut().detach().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
