//! TCP-Relay – Bindet Socket, akzeptiert Verbindungen
//!
//! Der `RelayServer` ersetzt den prozessinternen Bus, wenn Sessions auf
//! verschiedenen Rechnern laufen. Er ist zustandslos: jede Nachricht geht an
//! alle anderen verbundenen Clients, ohne Historie und ohne Routing.
//!
//! ## Concurrency-Modell
//! Pro Verbindung ein tokio-Task mit einer `RelayConnection`. Der gemeinsame
//! Zustand steckt im `RelayBroadcaster` (DashMap).

use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::broadcast::RelayBroadcaster;
use crate::connection::RelayConnection;
use crate::error::SignalingResult;

/// Einstellungen des Relays
#[derive(Debug, Clone)]
pub struct RelayEinstellungen {
    /// Maximale Anzahl gleichzeitiger Clients
    pub max_clients: usize,
    /// Send-Queue-Groesse pro Client
    pub sende_queue: usize,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_size: usize,
}

impl Default for RelayEinstellungen {
    fn default() -> Self {
        Self {
            max_clients: 1024,
            sende_queue: 64,
            max_frame_size: kristal_protocol::wire::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// TCP-Signaling-Relay
pub struct RelayServer {
    listener: TcpListener,
    broadcaster: RelayBroadcaster,
    einstellungen: RelayEinstellungen,
}

impl RelayServer {
    /// Bindet den TCP-Socket
    ///
    /// Port 0 waehlt einen freien Port; die tatsaechliche Adresse liefert
    /// [`RelayServer::lokale_adresse`].
    pub async fn binden(
        bind_addr: SocketAddr,
        einstellungen: RelayEinstellungen,
    ) -> SignalingResult<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            broadcaster: RelayBroadcaster::neu(einstellungen.sende_queue),
            einstellungen,
        })
    }

    /// Gibt die gebundene Adresse zurueck
    pub fn lokale_adresse(&self) -> SignalingResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle auf den Broadcaster (Statistik fuer Metriken)
    pub fn broadcaster(&self) -> RelayBroadcaster {
        self.broadcaster.clone()
    }

    /// Akzeptiert Verbindungen bis `shutdown_rx` ein `true`-Signal empfaengt
    pub async fn starten(
        self,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> SignalingResult<()> {
        tracing::info!(
            adresse = %self.lokale_adresse()?,
            max_clients = self.einstellungen.max_clients,
            "Signaling-Relay gestartet"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if self.broadcaster.client_anzahl() >= self.einstellungen.max_clients {
                                tracing::warn!(
                                    peer = %peer_addr,
                                    max = self.einstellungen.max_clients,
                                    "Relay voll – Verbindung abgelehnt"
                                );
                                drop(stream);
                                continue;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(peer = %peer_addr, fehler = %e, "TCP_NODELAY nicht gesetzt");
                            }

                            let verbindung = RelayConnection::neu(
                                self.broadcaster.clone(),
                                peer_addr,
                                self.einstellungen.max_frame_size,
                            );
                            tokio::spawn(verbindung.verarbeiten(stream, shutdown_rx.clone()));
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Relay: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("Signaling-Relay gestoppt");
        Ok(())
    }
}
