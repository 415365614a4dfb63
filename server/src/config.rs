//! Relay-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass das Relay ohne Konfigurationsdatei
//! lauffaehig ist.

use kristal_core::KristalError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Vollstaendige Relay-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Signaling-Relay (TCP)
    pub relay: RelayAbschnitt,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
}

/// Einstellungen des TCP-Relays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayAbschnitt {
    pub bind_adresse: String,
    pub port: u16,
    /// Maximale Anzahl gleichzeitiger Clients
    pub max_clients: usize,
    /// Send-Queue-Groesse pro Client; volle Queues verwerfen Nachrichten
    pub sende_queue: usize,
}

impl Default for RelayAbschnitt {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 9987,
            max_clients: 1024,
            sende_queue: 64,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// Aktiviert den Observability-Server
    pub aktiviert: bool,
    /// Port fuer Metriken und Health (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

impl RelayConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => toml::from_str::<Self>(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.validieren()?;
        Ok(config)
    }

    /// Prueft Werte, die serde allein nicht abfangen kann
    pub fn validieren(&self) -> Result<(), KristalError> {
        if self.relay.max_clients == 0 {
            return Err(KristalError::Konfiguration(
                "relay.max_clients muss groesser 0 sein".into(),
            ));
        }
        if self.relay.sende_queue == 0 {
            return Err(KristalError::Konfiguration(
                "relay.sende_queue muss groesser 0 sein".into(),
            ));
        }
        if self.observability.aktiviert && self.observability.port == self.relay.port {
            return Err(KristalError::Konfiguration(format!(
                "Observability-Port {} kollidiert mit dem Relay-Port",
                self.observability.port
            )));
        }
        self.relay_bind_adresse()?;
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse des Relays zurueck
    pub fn relay_bind_adresse(&self) -> Result<SocketAddr, KristalError> {
        adresse(&self.relay.bind_adresse, self.relay.port)
    }

    /// Gibt die Bind-Adresse fuer den Observability-Server zurueck
    pub fn observability_bind_adresse(&self) -> Result<SocketAddr, KristalError> {
        adresse(&self.relay.bind_adresse, self.observability.port)
    }
}

fn adresse(host: &str, port: u16) -> Result<SocketAddr, KristalError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| KristalError::Konfiguration(format!("Ungueltige Bind-Adresse '{host}': {e}")))
}
