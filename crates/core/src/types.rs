//! Gemeinsame Identifikationstypen fuer Kristal
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Eindeutige Benutzer-ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Erstellt eine neue zufaellige UserId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    /// Akzeptiert sowohl die nackte UUID als auch die `user:`-Darstellung
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let roh = s.strip_prefix("user:").unwrap_or(s);
        Uuid::parse_str(roh).map(Self)
    }
}

/// Eindeutige Kanal-ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    /// Erstellt eine neue zufaellige ChannelId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel:{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let roh = s.strip_prefix("channel:").unwrap_or(s);
        Uuid::parse_str(roh).map(Self)
    }
}

/// Art eines Kanals – nur Voice-Kanaele starten eine Media-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelTyp {
    Text,
    Voice,
}

impl ChannelTyp {
    pub fn ist_voice(&self) -> bool {
        matches!(self, Self::Voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_eindeutig() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b, "Zwei neue UserIds muessen verschieden sein");
    }

    #[test]
    fn channel_id_display() {
        let id = ChannelId(Uuid::nil());
        assert!(id.to_string().starts_with("channel:"));
    }

    #[test]
    fn user_id_parsen_mit_und_ohne_praefix() {
        let uid = UserId::new();
        let nackt: UserId = uid.inner().to_string().parse().unwrap();
        let mit_praefix: UserId = uid.to_string().parse().unwrap();
        assert_eq!(nackt, uid);
        assert_eq!(mit_praefix, uid);
        assert!("kein-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn channel_id_parsen() {
        let cid = ChannelId::new();
        assert_eq!(cid.to_string().parse::<ChannelId>().unwrap(), cid);
        assert!("channel:".parse::<ChannelId>().is_err());
    }

    #[test]
    fn ids_sind_serde_kompatibel() {
        let uid = UserId::new();
        let json = serde_json::to_string(&uid).unwrap();
        // Newtype wird als nackter UUID-String serialisiert
        assert_eq!(json, format!("\"{}\"", uid.inner()));
        let uid2: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, uid2);
    }

    #[test]
    fn channel_typ_serde() {
        assert_eq!(serde_json::to_string(&ChannelTyp::Voice).unwrap(), "\"voice\"");
        assert!(ChannelTyp::Voice.ist_voice());
        assert!(!ChannelTyp::Text.ist_voice());
    }
}
