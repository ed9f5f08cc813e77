//! Scanner binary: scans the payment ledger on a fixed schedule, or once with `--once`.

use std::io;

use pay_sentinel_domain::config::{BootstrapConfig, ScanSettings};
use pay_sentinel_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use pay_sentinel_scanner::{run_scheduled, ScanError, Scanner, WebhookSink};
use pay_sentinel_storage::SeaOrmStorage;
use tracing::info;

#[tokio::main]
async fn main() -> io::Result<()> {
    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    if let Err(err) = bootstrap(once).await {
        eprintln!("[scanner] run failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap(once: bool) -> Result<(), ScanError> {
    let config = BootstrapConfig::load_from_env()?;
    let settings = ScanSettings::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("SCANNER")?;
    init_telemetry(&telemetry_config)?;

    let storage = SeaOrmStorage::builder()
        .database_url(config.database_url())
        .watermark_keys(settings.watermark_keys.clone())
        .build()
        .await?;
    let sink = WebhookSink::new(config.backend_base_url(), config.webhook_token())?;
    info!(endpoint = sink.endpoint(), once, "scanner starting");
    let scanner = Scanner::new(storage, sink, settings);

    if once {
        let report = scanner.run_with_retry().await?;
        info!(?report, "scan finished");
        return Ok(());
    }

    run_scheduled(&scanner, config.schedule_interval()).await;
    Ok(())
}
