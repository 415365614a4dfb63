//! kristal-relay – Bibliotheks-Root
//!
//! Setzt Signaling-Relay, Metrik-Spiegelung und Observability-Server
//! zusammen und stellt den Einstiegspunkt fuer Tests bereit.

pub mod config;

use anyhow::Result;
use config::RelayConfig;
use kristal_observability::{observability_server_starten, HealthState, KristalMetrics};
use kristal_signaling::{RelayBroadcaster, RelayEinstellungen, RelayServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;

/// Intervall der Metrik-Spiegelung
const SPIEGEL_INTERVALL: Duration = Duration::from_secs(1);

/// Gebundenes, noch nicht laufendes Relay
pub struct Relay {
    config: RelayConfig,
    server: RelayServer,
    metriken: KristalMetrics,
    health: HealthState,
}

impl Relay {
    /// Bindet den Relay-Socket laut Konfiguration
    pub async fn binden(config: RelayConfig) -> Result<Self> {
        let einstellungen = RelayEinstellungen {
            max_clients: config.relay.max_clients,
            sende_queue: config.relay.sende_queue,
            ..RelayEinstellungen::default()
        };
        let server = RelayServer::binden(config.relay_bind_adresse()?, einstellungen).await?;

        Ok(Self {
            config,
            server,
            metriken: KristalMetrics::neu()?,
            health: HealthState::neu(),
        })
    }

    /// Tatsaechliche Relay-Adresse (relevant bei Port 0)
    pub fn adresse(&self) -> Result<SocketAddr> {
        Ok(self.server.lokale_adresse()?)
    }

    pub fn metriken(&self) -> KristalMetrics {
        self.metriken.clone()
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Laeuft bis `shutdown_rx` ein `true`-Signal empfaengt
    ///
    /// Reihenfolge:
    /// 1. Observability-Server starten (falls aktiviert)
    /// 2. Metrik-Spiegelung starten
    /// 3. Relay annehmen lassen bis zum Shutdown
    pub async fn ausfuehren(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        if self.config.observability.aktiviert {
            let addr = self.config.observability_bind_adresse()?;
            let metriken = self.metriken.clone();
            let health = self.health.clone();
            tokio::spawn(async move {
                if let Err(e) = observability_server_starten(addr, metriken, health).await {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            });
        }

        let spiegel = tokio::spawn(metriken_spiegeln(
            self.server.broadcaster(),
            self.metriken.clone(),
            self.health.clone(),
            shutdown_rx.clone(),
        ));

        self.health.relay_status_setzen(true);
        let ergebnis = self.server.starten(shutdown_rx).await;
        self.health.relay_status_setzen(false);

        spiegel.abort();
        ergebnis?;
        tracing::info!("Relay beendet");
        Ok(())
    }
}

/// Uebertraegt die Relay-Zaehler periodisch in Prometheus und Health
async fn metriken_spiegeln(
    broadcaster: RelayBroadcaster,
    metriken: KristalMetrics,
    health: HealthState,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut intervall = tokio::time::interval(SPIEGEL_INTERVALL);
    intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = intervall.tick() => {
                let stand = broadcaster.statistik();
                metriken.relay_stand_uebernehmen(stand.clients, stand.weitergeleitet, stand.verworfen);
                health.clients_setzen(stand.clients);
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
