//! Kristal Relay – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet das
//! Signaling-Relay.

use anyhow::Result;
use kristal_observability::logging_initialisieren;
use kristal_relay::{config::RelayConfig, Relay};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("KRISTAL_CONFIG").unwrap_or_else(|_| "config.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let config = RelayConfig::laden(&config_pfad)?;

    logging_initialisieren(&config.logging.level, &config.logging.format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Kristal Relay wird initialisiert"
    );

    let relay = Relay::binden(config).await?;
    tracing::info!(adresse = %relay.adresse()?, "Relay gebunden");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown-Signal empfangen, Relay wird beendet"),
            Err(e) => {
                tracing::error!(fehler = %e, "Ctrl-C-Handler nicht installierbar");
                return;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    relay.ausfuehren(shutdown_rx).await
}
