//! Fehlertypen fuer die Voice-Session

use kristal_core::types::UserId;
use thiserror::Error;

/// Alle moeglichen Fehler der Voice-Session
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Mikrofonzugriff fehlgeschlagen: {0}")]
    MedienZugriff(String),

    #[error("Verhandlung mit {remote} fehlgeschlagen: {grund}")]
    Verhandlung { remote: UserId, grund: String },

    #[error("Ungueltige Sitzungsbeschreibung: {0}")]
    UngueltigeBeschreibung(String),

    #[error("Voice-Session ist beendet")]
    SessionBeendet,

    #[error("Codec-Fehler: {0}")]
    Codec(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Erstellt einen Verhandlungsfehler fuer `remote`
    pub fn verhandlung(remote: UserId, grund: impl Into<String>) -> Self {
        Self::Verhandlung {
            remote,
            grund: grund.into(),
        }
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
