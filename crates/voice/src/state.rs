//! Voice-State – Momentaufnahme einer Session fuer die Praesentationsschicht
//!
//! Der Session-Task baut nach jeder Zustandsaenderung eine neue
//! Momentaufnahme und verteilt sie an Beobachter. Die Momentaufnahme ist
//! ein reiner Wert; sie teilt keinen Zustand mit der Session.

use kristal_core::types::{ChannelId, UserId};
use kristal_signaling::Praesenz;
use std::collections::BTreeSet;

/// Verbindungsstatus der Session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerbindungsStatus {
    #[default]
    Getrennt,
    /// Mikrofon wird geoeffnet
    Verbindend,
    Verbunden,
}

/// Vollstaendiger, beobachtbarer Zustand einer Voice-Session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceSessionState {
    pub status: VerbindungsStatus,
    /// Channel mit aktiver Mediensession
    pub aktiver_channel: Option<ChannelId>,
    pub stumm: bool,
    pub taub: bool,
    /// Nur Praesentationszustand, es wird keine Videospur erzeugt
    pub video: bool,
    /// Nur Praesentationszustand, es wird keine Spur erzeugt
    pub bildschirmfreigabe: bool,
    /// Verifizierte Teilnehmer: die lokale Id plus jeder Remote mit Verbindung
    pub teilnehmer: BTreeSet<UserId>,
    /// Beratende globale Channel-Belegung aus beobachtetem Join/Leave
    pub channel_teilnehmer: Praesenz,
    /// Sprechende Teilnehmer inklusive der lokalen Id
    pub sprechende: BTreeSet<UserId>,
}

impl VoiceSessionState {
    pub fn ist_verbunden(&self) -> bool {
        self.status == VerbindungsStatus::Verbunden
    }

    /// Prueft ob `user` laut Monitor gerade spricht
    pub fn spricht(&self, user: &UserId) -> bool {
        self.sprechende.contains(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ist_getrennt_und_leer() {
        let zustand = VoiceSessionState::default();
        assert_eq!(zustand.status, VerbindungsStatus::Getrennt);
        assert!(!zustand.ist_verbunden());
        assert!(zustand.aktiver_channel.is_none());
        assert!(zustand.teilnehmer.is_empty());
        assert!(zustand.channel_teilnehmer.ist_beratend());
    }

    #[test]
    fn gleichheit_erkennt_aenderungen() {
        let a = VoiceSessionState::default();
        let mut b = a.clone();
        assert_eq!(a, b);

        let uid = UserId::new();
        b.sprechende.insert(uid);
        assert_ne!(a, b);
        assert!(b.spricht(&uid));
    }
}
