//! Fehlertypen fuer den Signaling-Layer

use thiserror::Error;

/// Fehlertyp fuer Bus und Relay
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Verbindung zum Relay wurde getrennt (Queue geschlossen)
    #[error("Verbindung getrennt")]
    VerbindungGetrennt,

    /// Send-Queue voll – Nachricht verworfen
    #[error("Send-Queue voll")]
    QueueVoll,
}

/// Result-Typ fuer den Signaling-Layer
pub type SignalingResult<T> = Result<T, SignalingError>;
