//! Relay-Bus – Client-Seite des TCP-Relays
//!
//! Implementiert [`SignalingBus`] ueber eine TCP-Verbindung zum
//! [`crate::tcp::RelayServer`]. Die Nachrichtentaxonomie bleibt identisch zum
//! prozessinternen Bus, nur der Transport wechselt.
//!
//! ```text
//! publizieren() -> Send-Queue (mpsc) -> Schreib-Task -> TCP
//! TCP -> Lese-Task -> broadcast::Sender -> abonnieren()
//! ```
//!
//! Das Relay liefert eigene Nachrichten nicht zurueck. Damit sich der
//! RelayBus wie der lokale Bus verhaelt, werden publizierte Nachrichten
//! zusaetzlich lokal an die eigenen Empfaenger verteilt.

use futures_util::{SinkExt, StreamExt};
use kristal_protocol::{SignalCodec, SignalNachricht};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::bus::SignalingBus;
use crate::error::{SignalingError, SignalingResult};

/// Bus-Implementierung ueber das TCP-Relay
pub struct RelayBus {
    relay_addr: SocketAddr,
    sende_tx: mpsc::Sender<SignalNachricht>,
    empfang_tx: broadcast::Sender<SignalNachricht>,
    lese_task: JoinHandle<()>,
}

impl RelayBus {
    /// Verbindet sich mit dem Relay und startet Lese- und Schreib-Task
    pub async fn verbinden(relay_addr: SocketAddr, kapazitaet: usize) -> SignalingResult<Self> {
        let stream = TcpStream::connect(relay_addr).await?;
        stream.set_nodelay(true)?;

        let (mut sink, mut quelle) = Framed::new(stream, SignalCodec::new()).split();
        let (sende_tx, mut sende_rx) = mpsc::channel::<SignalNachricht>(kapazitaet.max(1));
        let (empfang_tx, _) = broadcast::channel(kapazitaet.max(1));

        tokio::spawn(async move {
            while let Some(nachricht) = sende_rx.recv().await {
                if let Err(e) = sink.send(nachricht).await {
                    tracing::warn!(relay = %relay_addr, fehler = %e, "Senden an Relay fehlgeschlagen");
                    break;
                }
            }
            tracing::debug!(relay = %relay_addr, "Schreib-Task beendet");
        });

        let lese_tx = empfang_tx.clone();
        let lese_task = tokio::spawn(async move {
            while let Some(frame) = quelle.next().await {
                match frame {
                    Ok(nachricht) => {
                        // Ohne lokale Empfaenger geht die Nachricht verloren
                        let _ = lese_tx.send(nachricht);
                    }
                    Err(e) => {
                        tracing::warn!(relay = %relay_addr, fehler = %e, "Frame-Lesefehler vom Relay");
                        break;
                    }
                }
            }
            tracing::info!(relay = %relay_addr, "Verbindung zum Relay beendet");
        });

        tracing::info!(relay = %relay_addr, "Mit Signaling-Relay verbunden");

        Ok(Self {
            relay_addr,
            sende_tx,
            empfang_tx,
            lese_task,
        })
    }

    /// Reiht eine Nachricht in die Send-Queue ein
    pub fn senden(&self, nachricht: SignalNachricht) -> SignalingResult<()> {
        match self.sende_tx.try_send(nachricht) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SignalingError::QueueVoll),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalingError::VerbindungGetrennt),
        }
    }

    /// Adresse des Relays
    pub fn relay_adresse(&self) -> SocketAddr {
        self.relay_addr
    }
}

impl SignalingBus for RelayBus {
    fn publizieren(&self, nachricht: SignalNachricht) {
        let art = nachricht.art();
        // Lokale Zustellung wie beim prozessinternen Bus
        let _ = self.empfang_tx.send(nachricht.clone());
        if let Err(e) = self.senden(nachricht) {
            tracing::warn!(relay = %self.relay_addr, art, fehler = %e, "Nachricht nicht an Relay uebergeben");
        }
    }

    fn abonnieren(&self) -> broadcast::Receiver<SignalNachricht> {
        self.empfang_tx.subscribe()
    }
}

impl Drop for RelayBus {
    fn drop(&mut self) {
        // Schreib-Task endet von selbst sobald `sende_tx` gedroppt ist
        self.lese_task.abort();
    }
}
