//! Fehlertypen fuer Kristal
//!
//! Zentraler Fehler-Enum fuer crate-uebergreifende Fehler der Binaries. Die
//! Untercrates definieren eigene Fehler (`SignalingError`, `VoiceError`).

use thiserror::Error;

/// Globaler Result-Alias fuer Kristal
pub type Result<T> = std::result::Result<T, KristalError>;

/// Crate-uebergreifende Fehler im Kristal-Voice-System
#[derive(Debug, Error)]
pub enum KristalError {
    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl KristalError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = KristalError::Konfiguration("port fehlt".into());
        assert_eq!(e.to_string(), "Konfigurationsfehler: port fehlt");
        assert_eq!(KristalError::intern("x").to_string(), "Interner Fehler: x");
    }

    #[test]
    fn anyhow_wird_durchgereicht() {
        let e: KristalError = anyhow::anyhow!("unten").into();
        assert_eq!(e.to_string(), "unten");
    }
}
