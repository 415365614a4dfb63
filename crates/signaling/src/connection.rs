//! Relay-Connection – Verarbeitet eine einzelne TCP-Verbindung zum Relay
//!
//! Jede TCP-Verbindung bekommt eine `RelayConnection` in einem eigenen
//! tokio-Task. Eingehende Frames werden an alle anderen Clients verteilt,
//! die eigene Send-Queue wird auf den Socket geschrieben.
//!
//! Ein ungueltiges Frame beendet die Verbindung; das Relay prueft keine
//! Inhalte ueber das Frame-Format hinaus.

use futures_util::{SinkExt, StreamExt};
use kristal_protocol::SignalCodec;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::broadcast::RelayBroadcaster;

/// Verarbeitet eine einzelne Relay-Verbindung
pub struct RelayConnection {
    broadcaster: RelayBroadcaster,
    peer_addr: SocketAddr,
    max_frame_size: usize,
}

impl RelayConnection {
    /// Erstellt eine neue RelayConnection
    pub fn neu(broadcaster: RelayBroadcaster, peer_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            broadcaster,
            peer_addr,
            max_frame_size,
        }
    }

    /// Startet die Verbindungs-Verarbeitungsschleife
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal eingeht.
    pub async fn verarbeiten(
        self,
        stream: TcpStream,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let peer_addr = self.peer_addr;
        let mut framed = Framed::new(stream, SignalCodec::with_max_size(self.max_frame_size));
        let (id, mut sende_rx) = self.broadcaster.client_registrieren();

        tracing::info!(peer = %peer_addr, verbindung = %id, "Neue Relay-Verbindung");

        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(nachricht)) => {
                            tracing::trace!(
                                verbindung = %id,
                                art = nachricht.art(),
                                absender = %nachricht.absender(),
                                "Nachricht empfangen"
                            );
                            self.broadcaster.an_alle_ausser_senden(&id, nachricht);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(
                                peer = %peer_addr,
                                fehler = %e,
                                "Frame-Lesefehler – Verbindung wird getrennt"
                            );
                            break;
                        }
                        None => {
                            tracing::info!(peer = %peer_addr, "Verbindung vom Client getrennt");
                            break;
                        }
                    }
                }

                Some(ausgehend) = sende_rx.recv() => {
                    if let Err(e) = framed.send(ausgehend).await {
                        tracing::warn!(
                            peer = %peer_addr,
                            fehler = %e,
                            "Weiterleiten fehlgeschlagen"
                        );
                        break;
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(peer = %peer_addr, "Shutdown-Signal – Verbindung wird getrennt");
                        break;
                    }
                }
            }
        }

        self.broadcaster.client_entfernen(&id);
        tracing::debug!(peer = %peer_addr, verbindung = %id, "Verbindungs-Task beendet");
    }
}
