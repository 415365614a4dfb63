//! Health-Check-Endpunkt fuer das Kristal-Relay
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime, Startzeit und Relay-Zustand

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status des Health-Checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub gestartet_um: DateTime<Utc>,
    pub relay_aktiv: bool,
    pub relay_clients: usize,
}

/// Geteilter Zustand fuer den Health-Check-Handler
///
/// Clone teilt den Zustand; das Relay setzt ihn, der Handler liest ihn.
#[derive(Clone)]
pub struct HealthState {
    start: Instant,
    gestartet_um: DateTime<Utc>,
    relay_aktiv: Arc<AtomicBool>,
    relay_clients: Arc<AtomicUsize>,
}

impl HealthState {
    pub fn neu() -> Self {
        Self {
            start: Instant::now(),
            gestartet_um: Utc::now(),
            relay_aktiv: Arc::new(AtomicBool::new(false)),
            relay_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn relay_aktiv(&self) -> bool {
        self.relay_aktiv.load(Ordering::Relaxed)
    }

    /// Markiert ob der Relay-Listener Verbindungen annimmt
    pub fn relay_status_setzen(&self, aktiv: bool) {
        self.relay_aktiv.store(aktiv, Ordering::Relaxed);
    }

    pub fn clients_setzen(&self, anzahl: usize) {
        self.relay_clients.store(anzahl, Ordering::Relaxed);
    }

    /// Baut die Antwort aus dem aktuellen Zustand
    pub fn antwort(&self) -> HealthResponse {
        let relay_aktiv = self.relay_aktiv();
        HealthResponse {
            status: if relay_aktiv {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            gestartet_um: self.gestartet_um,
            relay_aktiv,
            relay_clients: self.relay_clients.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::neu()
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – 503 solange der Relay-Listener nicht laeuft
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();
    let http_status = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(response))
}
