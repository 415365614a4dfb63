//! kristal-signaling – Signaling-Bus, Relay und Presence
//!
//! ## Architektur
//!
//! ```text
//! VoiceSession (je Prozess eine oder mehrere)
//!     |  publizieren / abonnieren
//!     v
//! SignalingBus (Trait)
//!     +-- LokalerBus  (tokio broadcast, prozessintern)
//!     +-- RelayBus    (TCP-Client)  --->  RelayServer (TCP, Fan-out)
//!                                              |
//!                                              v
//!                                      RelayConnection (pro Client ein Task)
//!                                      RelayBroadcaster (Send-Queues)
//!
//! PresenceTracker – beratende Sicht: wer ist in welchem Channel
//! ```

pub mod broadcast;
pub mod bus;
pub mod connection;
pub mod error;
pub mod presence;
pub mod relay_bus;
pub mod tcp;

// Bequeme Re-Exporte
pub use broadcast::{RelayBroadcaster, RelayStatistik};
pub use bus::{LokalerBus, SignalingBus};
pub use error::{SignalingError, SignalingResult};
pub use presence::{Praesenz, PresenceTracker};
pub use relay_bus::RelayBus;
pub use tcp::{RelayEinstellungen, RelayServer};
