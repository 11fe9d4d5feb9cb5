//! `recurrent-charge` entry point.
//!
//! Usage: `recurrent-charge [ID[,ID...]]`. Without arguments every due
//! attempt is charged; with a list only those attempts are considered.

use recurrent_billing::config::RecurrentConfig;
use recurrent_billing::services::{get_metrics, init_metrics, GatewayRegistry, ManualGateway};
use recurrent_billing::startup::Application;

use service_core::observability::init_tracing;
use std::sync::Arc;
use uuid::Uuid;

fn parse_ids(arg: Option<String>) -> Result<Option<Vec<Uuid>>, String> {
    let Some(arg) = arg else {
        return Ok(None);
    };
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Uuid::parse_str(s).map_err(|e| format!("Invalid attempt id '{}': {}", s, e)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let ids = parse_ids(std::env::args().nth(1)).map_err(|e| {
        eprintln!("{}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    // Load configuration
    let config = RecurrentConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    // Initialize tracing
    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing error: {}", e)))?;

    tracing::info!(
        version = %config.service_version,
        storage = ?config.storage,
        lock = ?config.lock.backend,
        narrowed = ids.is_some(),
        "Starting recurrent charge run"
    );

    // Initialize metrics
    init_metrics();

    let gateways = GatewayRegistry::new().with(Arc::new(ManualGateway));

    let app = Application::build(config, gateways).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let summary = app.run_once(ids.as_deref()).await.map_err(|e| {
        tracing::error!(error = %e, "Recurrent charge run aborted");
        std::io::Error::other(format!("Run aborted: {}", e))
    })?;

    for attempt in &summary.attempts {
        println!("{}", attempt);
    }
    println!(
        "Processed {} attempts in {:.3}s: {} charged, {} pending, {} failed, {} stopped, {} fast-charge, {} unhandled, {} skipped, {} errors",
        summary.processed,
        summary.elapsed.as_secs_f64(),
        summary.charged,
        summary.pending,
        summary.failed,
        summary.stopped,
        summary.fast_charge_stopped,
        summary.unhandled,
        summary.skipped,
        summary.errors,
    );

    tracing::debug!(metrics = %get_metrics(), "Final metrics");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_argument_means_every_due_attempt() {
        assert_eq!(parse_ids(None).unwrap(), None);
    }

    #[test]
    fn comma_separated_ids_are_parsed() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ids = parse_ids(Some(format!("{}, {},", a, b))).unwrap();
        assert_eq!(ids, Some(vec![a, b]));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_ids(Some("not-a-uuid".to_string())).is_err());
    }
}
