//! Relay-Broadcaster – Verteilt Nachrichten an alle Relay-Clients
//!
//! Der RelayBroadcaster verwaltet die Send-Queues aller verbundenen
//! Relay-Clients. Jede eingehende Nachricht geht an alle Clients ausser dem
//! Einlieferer; das Relay kennt weder Channels noch Adressaten.

use dashmap::DashMap;
use kristal_protocol::SignalNachricht;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// VerbindungsId
// ---------------------------------------------------------------------------

/// Prozessweit eindeutige Kennung einer Relay-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerbindungsId(pub u64);

impl std::fmt::Display for VerbindungsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay-conn:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Handle auf die Send-Queue eines Relay-Clients
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub id: VerbindungsId,
    pub tx: mpsc::Sender<SignalNachricht>,
}

impl ClientSender {
    /// Sendet eine Nachricht nicht-blockierend an den Client
    ///
    /// Gibt `false` zurueck wenn die Queue voll oder geschlossen ist.
    pub fn senden(&self, nachricht: SignalNachricht) -> bool {
        match self.tx.try_send(nachricht) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(verbindung = %self.id, "Send-Queue voll – Nachricht verworfen");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(verbindung = %self.id, "Send-Queue geschlossen (Client getrennt)");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RelayStatistik
// ---------------------------------------------------------------------------

/// Momentaufnahme der Relay-Zaehler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatistik {
    pub clients: usize,
    pub weitergeleitet: u64,
    pub verworfen: u64,
}

// ---------------------------------------------------------------------------
// RelayBroadcaster
// ---------------------------------------------------------------------------

/// Zentraler Fan-out fuer alle Relay-Clients
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct RelayBroadcaster {
    inner: Arc<RelayBroadcasterInner>,
}

struct RelayBroadcasterInner {
    clients: DashMap<VerbindungsId, ClientSender>,
    naechste_id: AtomicU64,
    queue_groesse: usize,
    weitergeleitet: AtomicU64,
    verworfen: AtomicU64,
}

impl RelayBroadcaster {
    /// Erstellt einen neuen RelayBroadcaster mit der Send-Queue-Groesse pro Client
    pub fn neu(queue_groesse: usize) -> Self {
        Self {
            inner: Arc::new(RelayBroadcasterInner {
                clients: DashMap::new(),
                naechste_id: AtomicU64::new(1),
                queue_groesse: queue_groesse.max(1),
                weitergeleitet: AtomicU64::new(0),
                verworfen: AtomicU64::new(0),
            }),
        }
    }

    /// Registriert einen neuen Client und gibt seine Empfangs-Queue zurueck
    ///
    /// Die Relay-Verbindung liest aus dieser Queue und schreibt auf den Socket.
    pub fn client_registrieren(&self) -> (VerbindungsId, mpsc::Receiver<SignalNachricht>) {
        let id = VerbindungsId(self.inner.naechste_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.queue_groesse);
        self.inner.clients.insert(id, ClientSender { id, tx });
        tracing::debug!(verbindung = %id, "Client im Relay registriert");
        (id, rx)
    }

    /// Entfernt einen Client aus dem Broadcaster
    pub fn client_entfernen(&self, id: &VerbindungsId) {
        if self.inner.clients.remove(id).is_some() {
            tracing::debug!(verbindung = %id, "Client aus Relay entfernt");
        }
    }

    /// Sendet eine Nachricht an alle Clients ausser dem Einlieferer
    ///
    /// Gibt die Anzahl der erfolgreichen Sendungen zurueck.
    pub fn an_alle_ausser_senden(
        &self,
        ausgeschlossen: &VerbindungsId,
        nachricht: SignalNachricht,
    ) -> usize {
        let mut gesendet = 0;
        let mut verworfen = 0;
        self.inner.clients.iter().for_each(|entry| {
            if entry.key() == ausgeschlossen {
                return;
            }
            if entry.value().senden(nachricht.clone()) {
                gesendet += 1;
            } else {
                verworfen += 1;
            }
        });
        self.inner
            .weitergeleitet
            .fetch_add(gesendet as u64, Ordering::Relaxed);
        self.inner.verworfen.fetch_add(verworfen, Ordering::Relaxed);
        gesendet
    }

    /// Gibt die Anzahl der registrierten Clients zurueck
    pub fn client_anzahl(&self) -> usize {
        self.inner.clients.len()
    }

    /// Momentaufnahme aller Zaehler
    pub fn statistik(&self) -> RelayStatistik {
        RelayStatistik {
            clients: self.client_anzahl(),
            weitergeleitet: self.inner.weitergeleitet.load(Ordering::Relaxed),
            verworfen: self.inner.verworfen.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayBroadcaster {
    fn default() -> Self {
        Self::neu(64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
