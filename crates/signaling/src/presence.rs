//! Presence-Tracker – Wer ist in welchem Channel
//!
//! Baut aus beobachtetem Join/Leave-Verkehr eine globale Sicht auf die
//! Channel-Belegung auf, unabhaengig davon, ob die lokale Session selbst in
//! dem Channel verbunden ist.
//!
//! Diese Sicht ist beratend: Nachrichten, die vor dem Anhaengen an den Bus
//! publiziert wurden, fehlen. [`Praesenz`] traegt das im Typ, damit sie nie
//! mit der verifizierten Teilnehmerliste einer Session verwechselt wird.

use kristal_core::types::{ChannelId, UserId};
use kristal_protocol::SignalNachricht;
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Praesenz
// ---------------------------------------------------------------------------

/// Beratende Momentaufnahme der Channel-Belegung
///
/// Best-effort-Cache aus Signaling-Beobachtung, keine autoritative
/// Mitgliederliste.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Praesenz {
    channels: BTreeMap<ChannelId, BTreeSet<UserId>>,
}

impl Praesenz {
    /// Mitglieder eines Channels laut Beobachtung (leer wenn unbekannt)
    pub fn mitglieder(&self, channel_id: &ChannelId) -> BTreeSet<UserId> {
        self.channels.get(channel_id).cloned().unwrap_or_default()
    }

    /// Prueft ob `user` laut Beobachtung in `channel_id` ist
    pub fn ist_in(&self, channel_id: &ChannelId, user: &UserId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|ids| ids.contains(user))
    }

    /// Alle beobachteten Channels mit mindestens einem Mitglied
    pub fn channels(&self) -> impl Iterator<Item = (&ChannelId, &BTreeSet<UserId>)> {
        self.channels.iter()
    }

    /// Diese Sicht ist nie autoritativ
    pub fn ist_beratend(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// PresenceTracker
// ---------------------------------------------------------------------------

/// Verwaltet die globale Channel-Belegung einer Session
///
/// Gehoert exklusiv dem Session-Task; kein internes Locking.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    praesenz: Praesenz,
}

impl PresenceTracker {
    /// Erstellt einen leeren PresenceTracker
    pub fn neu() -> Self {
        Self::default()
    }

    /// Traegt `user` in `channel_id` ein
    ///
    /// Gibt `true` zurueck wenn sich die Sicht geaendert hat.
    pub fn beitreten(&mut self, channel_id: ChannelId, user: UserId) -> bool {
        let neu = self
            .praesenz
            .channels
            .entry(channel_id)
            .or_default()
            .insert(user);
        if neu {
            tracing::trace!(user_id = %user, channel_id = %channel_id, "Presence: beigetreten");
        }
        neu
    }

    /// Entfernt `user` aus `channel_id`; leere Channels werden aufgeraeumt
    ///
    /// Gibt `true` zurueck wenn sich die Sicht geaendert hat.
    pub fn verlassen(&mut self, channel_id: ChannelId, user: UserId) -> bool {
        let Some(ids) = self.praesenz.channels.get_mut(&channel_id) else {
            return false;
        };
        let entfernt = ids.remove(&user);
        if ids.is_empty() {
            self.praesenz.channels.remove(&channel_id);
        }
        if entfernt {
            tracing::trace!(user_id = %user, channel_id = %channel_id, "Presence: verlassen");
        }
        entfernt
    }

    /// Wendet beobachteten Join/Leave-Verkehr an
    ///
    /// Verhandlungsnachrichten aendern die Presence nicht.
    pub fn beobachten(&mut self, nachricht: &SignalNachricht) -> bool {
        match nachricht {
            SignalNachricht::Join { user_id, channel_id } => self.beitreten(*channel_id, *user_id),
            SignalNachricht::Leave { user_id, channel_id } => {
                self.verlassen(*channel_id, *user_id)
            }
            SignalNachricht::Offer { .. }
            | SignalNachricht::Answer { .. }
            | SignalNachricht::IceCandidate { .. } => false,
        }
    }

    /// Momentaufnahme fuer Subscriber
    pub fn schnappschuss(&self) -> Praesenz {
        self.praesenz.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
