//! kristal-voice – Voice-Session-Controller
//!
//! Koordiniert die Mediensession eines Teilnehmers in einem Voice-Channel:
//! Join/Leave, Peer-Verhandlung ueber den Signaling-Bus, Sprecher-Erkennung
//! und Zustandsbenachrichtigung.
//!
//! ## Module
//! - [`session`] – Handle und besitzender Session-Task
//! - [`peer`] – Peer-Manager (Offer/Answer/ICE pro Remote)
//! - [`monitor`] – Pegel-Monitor (sprechend/stumm pro Quelle)
//! - [`analyse`] – FFT-Spektrumsanalyse
//! - [`media`] – Schnittstellen zum Medien-Stack
//! - [`rtc`] – WebRTC-Backend (webrtc-rs, Audio-Geraete mit Feature `geraete`)
//! - [`sim`] – Simulations-Backend fuer Tests und `kristal-sim`
//! - [`state`] – Beobachtbare Momentaufnahme
//! - [`config`] – Einstellungen

pub mod analyse;
pub mod config;
pub mod error;
#[cfg(feature = "geraete")]
mod geraete;
pub mod media;
pub mod monitor;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod sim;
pub mod state;

pub use config::VoiceConfig;
pub use error::{VoiceError, VoiceResult};
pub use rtc::{PcmQuelle, WebRtcBackend};
pub use session::{Abonnement, VoiceSession};
pub use sim::{SimBackend, SimMedienNetz};
pub use state::{VerbindungsStatus, VoiceSessionState};
