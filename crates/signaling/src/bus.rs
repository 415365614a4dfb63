//! Signaling-Bus – Fan-out aller Signaling-Nachrichten
//!
//! Jede Voice-Session publiziert ihre Nachrichten auf dem Bus und empfaengt
//! jede Nachricht, die irgendeine Session publiziert hat. Der Bus filtert
//! nicht: auch eigene Nachrichten kommen zurueck und werden erst beim
//! Empfaenger anhand der `user_id` verworfen.
//!
//! ## Garantien
//! - Fire-and-forget: `publizieren` blockiert nie und bestaetigt nichts
//! - Ohne angehaengten Empfaenger geht eine Nachricht verloren
//! - Pro Absender bleibt die Reihenfolge erhalten, zwischen Absendern nicht
//!
//! Implementierungen: [`LokalerBus`] (prozessintern) und
//! [`crate::relay_bus::RelayBus`] (TCP-Relay ueber das Netzwerk).

use kristal_protocol::SignalNachricht;
use tokio::sync::broadcast;

/// Standard-Kapazitaet des Broadcast-Kanals
pub const STANDARD_KAPAZITAET: usize = 256;

/// Schnittstelle des Signaling-Busses
pub trait SignalingBus: Send + Sync + 'static {
    /// Publiziert eine Nachricht an alle angehaengten Empfaenger
    fn publizieren(&self, nachricht: SignalNachricht);

    /// Haengt einen neuen Empfaenger an
    ///
    /// Nachrichten, die vor dem Anhaengen publiziert wurden, werden nicht
    /// nachgeliefert.
    fn abonnieren(&self) -> broadcast::Receiver<SignalNachricht>;
}

// ---------------------------------------------------------------------------
// LokalerBus
// ---------------------------------------------------------------------------

/// Prozessinterner Bus ueber `tokio::sync::broadcast`
///
/// Clone teilt den inneren Kanal.
#[derive(Clone)]
pub struct LokalerBus {
    tx: broadcast::Sender<SignalNachricht>,
}

impl LokalerBus {
    /// Erstellt einen neuen Bus mit der gegebenen Kapazitaet
    pub fn neu(kapazitaet: usize) -> Self {
        let (tx, _) = broadcast::channel(kapazitaet.max(1));
        Self { tx }
    }

    /// Anzahl der aktuell angehaengten Empfaenger
    pub fn empfaenger_anzahl(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LokalerBus {
    fn default() -> Self {
        Self::neu(STANDARD_KAPAZITAET)
    }
}

impl SignalingBus for LokalerBus {
    fn publizieren(&self, nachricht: SignalNachricht) {
        let art = nachricht.art();
        if self.tx.send(nachricht).is_err() {
            tracing::trace!(art, "Kein Empfaenger am Bus – Nachricht verloren");
        }
    }

    fn abonnieren(&self) -> broadcast::Receiver<SignalNachricht> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kristal_core::types::{ChannelId, UserId};

    fn join(user_id: UserId, channel_id: ChannelId) -> SignalNachricht {
        SignalNachricht::Join { user_id, channel_id }
    }

    #[tokio::test]
    async fn alle_empfaenger_bekommen_jede_nachricht() {
        let bus = LokalerBus::default();
        let mut rx1 = bus.abonnieren();
        let mut rx2 = bus.abonnieren();
        let uid = UserId::new();
        let kanal = ChannelId::new();

        bus.publizieren(join(uid, kanal));

        assert_eq!(rx1.recv().await.unwrap().absender(), uid);
        assert_eq!(rx2.recv().await.unwrap().absender(), uid);
    }

    #[tokio::test]
    async fn ohne_empfaenger_geht_nachricht_verloren() {
        let bus = LokalerBus::default();
        bus.publizieren(join(UserId::new(), ChannelId::new()));

        // Spaeter angehaengter Empfaenger sieht die alte Nachricht nicht
        let mut rx = bus.abonnieren();
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.empfaenger_anzahl(), 1);
    }

    #[tokio::test]
    async fn reihenfolge_pro_absender_bleibt_erhalten() {
        let bus = LokalerBus::default();
        let mut rx = bus.abonnieren();
        let uid = UserId::new();
        let kanal = ChannelId::new();

        bus.publizieren(join(uid, kanal));
        bus.publizieren(SignalNachricht::Leave {
            user_id: uid,
            channel_id: kanal,
        });

        assert_eq!(rx.recv().await.unwrap().art(), "join");
        assert_eq!(rx.recv().await.unwrap().art(), "leave");
    }

    #[test]
    fn bus_ist_als_trait_objekt_nutzbar() {
        let bus: std::sync::Arc<dyn SignalingBus> = std::sync::Arc::new(LokalerBus::neu(4));
        let _rx = bus.abonnieren();
        bus.publizieren(join(UserId::new(), ChannelId::new()));
    }
}
