//! Signaling-Nachrichten
//!
//! Definiert die fuenf Nachrichtenarten, die zwischen Voice-Sessions ueber
//! den Signaling-Bus ausgetauscht werden.
//!
//! ## Design
//! - Tagged Enum (`"type"`-Feld) fuer typsicheres Dispatching per `match`
//! - JSON-Feldnamen in camelCase (`userId`, `targetId`, `channelId`)
//! - Verhandlungs-Payloads (SDP, ICE) sind opak und werden nur durchgereicht
//!
//! Jede Nachricht wird an alle Teilnehmer des Busses verteilt. Empfaenger,
//! die bei `offer`/`answer`/`ice-candidate` nicht adressiert sind,
//! ignorieren sie.

use kristal_core::types::{ChannelId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Verhandlungs-Payloads
// ---------------------------------------------------------------------------

/// Art einer Session-Beschreibung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeschreibungsTyp {
    Offer,
    Answer,
}

/// Session-Beschreibung (SDP) – opak fuer den Signaling-Layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitzungsBeschreibung {
    #[serde(rename = "type")]
    pub typ: BeschreibungsTyp,
    pub sdp: String,
}

impl SitzungsBeschreibung {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            typ: BeschreibungsTyp::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            typ: BeschreibungsTyp::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE-Kandidat (ein moeglicher Netzwerkpfad)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceKandidat {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceKandidat {
    pub fn neu(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SignalNachricht
// ---------------------------------------------------------------------------

/// Alle Nachrichten die ueber den Signaling-Bus fliessen
///
/// `user_id` ist immer der Absender. Verhandlungsnachrichten tragen
/// zusaetzlich `target_id`, den einzigen beabsichtigten Empfaenger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalNachricht {
    /// Absender ist dem Channel beigetreten
    Join {
        user_id: UserId,
        channel_id: ChannelId,
    },
    /// Absender hat den Channel verlassen
    Leave {
        user_id: UserId,
        channel_id: ChannelId,
    },
    /// SDP-Offer an genau einen Empfaenger
    Offer {
        user_id: UserId,
        target_id: UserId,
        channel_id: ChannelId,
        offer: SitzungsBeschreibung,
    },
    /// SDP-Answer an genau einen Empfaenger
    Answer {
        user_id: UserId,
        target_id: UserId,
        channel_id: ChannelId,
        answer: SitzungsBeschreibung,
    },
    /// ICE-Kandidat an genau einen Empfaenger
    IceCandidate {
        user_id: UserId,
        target_id: UserId,
        channel_id: ChannelId,
        candidate: IceKandidat,
    },
}

impl SignalNachricht {
    /// Absender der Nachricht
    pub fn absender(&self) -> UserId {
        match self {
            Self::Join { user_id, .. }
            | Self::Leave { user_id, .. }
            | Self::Offer { user_id, .. }
            | Self::Answer { user_id, .. }
            | Self::IceCandidate { user_id, .. } => *user_id,
        }
    }

    /// Channel auf den sich die Nachricht bezieht
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::Join { channel_id, .. }
            | Self::Leave { channel_id, .. }
            | Self::Offer { channel_id, .. }
            | Self::Answer { channel_id, .. }
            | Self::IceCandidate { channel_id, .. } => *channel_id,
        }
    }

    /// Adressat einer Verhandlungsnachricht (`None` bei Join/Leave)
    pub fn ziel(&self) -> Option<UserId> {
        match self {
            Self::Join { .. } | Self::Leave { .. } => None,
            Self::Offer { target_id, .. }
            | Self::Answer { target_id, .. }
            | Self::IceCandidate { target_id, .. } => Some(*target_id),
        }
    }

    /// Prueft ob die Nachricht an `user` adressiert ist
    pub fn ist_adressiert_an(&self, user: UserId) -> bool {
        self.ziel() == Some(user)
    }

    /// Kurzname der Nachrichtenart fuer Logs
    pub fn art(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_candidate_json_format() {
        let absender = UserId::new();
        let ziel = UserId::new();
        let kanal = ChannelId::new();
        let nachricht = SignalNachricht::IceCandidate {
            user_id: absender,
            target_id: ziel,
            channel_id: kanal,
            candidate: IceKandidat::neu("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host"),
        };

        let json: serde_json::Value = serde_json::to_value(&nachricht).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["userId"], absender.inner().to_string());
        assert_eq!(json["targetId"], ziel.inner().to_string());
        assert_eq!(json["channelId"], kanal.inner().to_string());
        assert!(json["candidate"]["candidate"].is_string());
        assert!(json["candidate"].get("sdpMid").is_none());
    }

    #[test]
    fn offer_aus_fremdem_json_lesen() {
        let absender = UserId::new();
        let ziel = UserId::new();
        let kanal = ChannelId::new();
        let json = format!(
            r#"{{"type":"offer","userId":"{}","targetId":"{}","channelId":"{}","offer":{{"type":"offer","sdp":"v=0"}}}}"#,
            absender.inner(),
            ziel.inner(),
            kanal.inner()
        );

        let nachricht: SignalNachricht = serde_json::from_str(&json).unwrap();
        assert_eq!(nachricht.absender(), absender);
        assert_eq!(nachricht.ziel(), Some(ziel));
        assert_eq!(nachricht.channel_id(), kanal);
        assert_eq!(nachricht.art(), "offer");
        match nachricht {
            SignalNachricht::Offer { offer, .. } => {
                assert_eq!(offer, SitzungsBeschreibung::offer("v=0"));
            }
            andere => panic!("Offer erwartet, erhalten: {andere:?}"),
        }
    }

    #[test]
    fn join_und_leave_haben_kein_ziel() {
        let uid = UserId::new();
        let kanal = ChannelId::new();
        let join = SignalNachricht::Join {
            user_id: uid,
            channel_id: kanal,
        };
        let leave = SignalNachricht::Leave {
            user_id: uid,
            channel_id: kanal,
        };
        assert_eq!(join.ziel(), None);
        assert!(!leave.ist_adressiert_an(uid));
        assert_eq!(serde_json::to_value(&leave).unwrap()["type"], "leave");
    }

    #[test]
    fn unbekannter_typ_wird_abgelehnt() {
        let json = r#"{"type":"kick","userId":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(serde_json::from_str::<SignalNachricht>(json).is_err());
    }
}
