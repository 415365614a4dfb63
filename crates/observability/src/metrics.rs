//! Prometheus-kompatible Metriken fuer das Kristal-Relay
//!
//! Registrierte Metriken:
//! - `kristal_relay_clients` – Gauge: Aktuell verbundene Relay-Clients
//! - `kristal_relay_nachrichten_total` – Counter: Weitergeleitete Nachrichten
//! - `kristal_relay_verworfen_total` – Counter: Wegen voller Queue verworfene Nachrichten

use anyhow::Result;
use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Alle Kristal-Prometheus-Metriken
#[derive(Clone)]
pub struct KristalMetrics {
    pub registry: Arc<Registry>,
    pub relay_clients: IntGauge,
    pub relay_nachrichten_total: IntCounter,
    pub relay_verworfen_total: IntCounter,
}

impl KristalMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let relay_clients = IntGauge::with_opts(Opts::new(
            "kristal_relay_clients",
            "Anzahl aktuell verbundener Relay-Clients",
        ))?;
        registry.register(Box::new(relay_clients.clone()))?;

        let relay_nachrichten_total = IntCounter::with_opts(Opts::new(
            "kristal_relay_nachrichten_total",
            "Gesamtanzahl weitergeleiteter Signaling-Nachrichten",
        ))?;
        registry.register(Box::new(relay_nachrichten_total.clone()))?;

        let relay_verworfen_total = IntCounter::with_opts(Opts::new(
            "kristal_relay_verworfen_total",
            "Gesamtanzahl verworfener Signaling-Nachrichten (volle Send-Queue)",
        ))?;
        registry.register(Box::new(relay_verworfen_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            relay_clients,
            relay_nachrichten_total,
            relay_verworfen_total,
        })
    }

    /// Uebernimmt absolute Zaehlerstaende des Relays
    ///
    /// Counter wachsen nur um die Differenz; kleinere Staende werden ignoriert.
    pub fn relay_stand_uebernehmen(&self, clients: usize, weitergeleitet: u64, verworfen: u64) {
        self.relay_clients
            .set(i64::try_from(clients).unwrap_or(i64::MAX));
        nachziehen(&self.relay_nachrichten_total, weitergeleitet);
        nachziehen(&self.relay_verworfen_total, verworfen);
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn nachziehen(counter: &IntCounter, stand: u64) {
    let aktuell = counter.get();
    if stand > aktuell {
        counter.inc_by(stand - aktuell);
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: KristalMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<KristalMetrics>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alle_metriken_registriert() {
        let metriken = KristalMetrics::neu().unwrap();
        let families = metriken.registry.gather();
        let namen: Vec<&str> = families.iter().map(|f| f.get_name()).collect();

        assert!(namen.contains(&"kristal_relay_clients"));
        assert!(namen.contains(&"kristal_relay_nachrichten_total"));
        assert!(namen.contains(&"kristal_relay_verworfen_total"));
    }

    #[test]
    fn stand_uebernehmen_zieht_counter_nach() {
        let metriken = KristalMetrics::neu().unwrap();
        metriken.relay_stand_uebernehmen(3, 10, 1);
        metriken.relay_stand_uebernehmen(2, 25, 1);

        assert_eq!(metriken.relay_clients.get(), 2);
        assert_eq!(metriken.relay_nachrichten_total.get(), 25);
        assert_eq!(metriken.relay_verworfen_total.get(), 1);
    }

    #[test]
    fn counter_laufen_nie_rueckwaerts() {
        let metriken = KristalMetrics::neu().unwrap();
        metriken.relay_stand_uebernehmen(1, 50, 5);
        metriken.relay_stand_uebernehmen(1, 10, 0);
        assert_eq!(metriken.relay_nachrichten_total.get(), 50);
        assert_eq!(metriken.relay_verworfen_total.get(), 5);
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = KristalMetrics::neu().unwrap();
        metriken.relay_stand_uebernehmen(5, 1, 0);

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("kristal_relay_clients 5"));
        assert!(output.contains("kristal_relay_nachrichten_total 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
