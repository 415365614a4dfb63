//! kristal-protocol – Signaling-Protokoll
//!
//! Definiert die Nachrichten, die zwischen Voice-Sessions ausgetauscht
//! werden, und das Frame-Format fuer die Relay-Verbindung.

pub mod signal;
pub mod wire;

pub use signal::{BeschreibungsTyp, IceKandidat, SignalNachricht, SitzungsBeschreibung};
pub use wire::SignalCodec;
