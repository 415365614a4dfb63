//! Medien-Schnittstellen – Trennlinie zwischen Verhandlungslogik und Medien-Stack
//!
//! Die Session kennt nur diese Traits. Das WebRTC-Backend aus [`crate::rtc`]
//! und das Simulationsnetz aus [`crate::sim`] sind austauschbar.
//!
//! ```text
//! VoiceSession
//!     |  mikrofon_oeffnen / verbindung_erstellen / wiedergabe_erstellen
//!     v
//! MediaBackend
//!     +-- PeerVerbindung   (Offer/Answer/ICE pro Remote-Teilnehmer)
//!     +-- MediaStream      (Mikrofon oder eingetroffene Remote-Spur)
//!     +-- Wiedergabe       (Ausgabe einer Remote-Spur)
//!
//! PeerVerbindung --PeerEreignis--> Session-Task (unbounded mpsc)
//! ```

use async_trait::async_trait;
use kristal_core::types::UserId;
use kristal_protocol::{IceKandidat, SitzungsBeschreibung};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::VoiceResult;

// ---------------------------------------------------------------------------
// Rolle
// ---------------------------------------------------------------------------

/// Verhandlungsrolle einer Verbindung, bei Erstellung festgelegt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rolle {
    /// Erstellt das Offer (hat den Join des Remote gesehen)
    Initiator,
    /// Beantwortet ein eingegangenes Offer
    Responder,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Audio-Quelle: lokales Mikrofon oder eingetroffene Remote-Spur
pub trait MediaStream: Send + Sync {
    /// Aktiviert/deaktiviert die ausgehende Spur (Mute)
    fn spur_aktivieren(&self, aktiv: bool);

    /// Stoppt die Aufnahme und gibt das Geraet frei; mehrfach aufrufbar
    fn stoppen(&self);

    /// Fuellt `puffer` mit dem aktuellen Analysefenster
    ///
    /// Gibt die Anzahl geschriebener Samples zurueck.
    fn pcm_lesen(&self, puffer: &mut [f32]) -> usize;

    /// Fortlaufende PCM-Frames fuer Uebertragung und Wiedergabe
    ///
    /// Quellen ohne echten Sample-Strom (z.B. das Simulationsnetz) liefern `None`.
    fn pcm_abonnieren(&self) -> Option<broadcast::Receiver<Arc<[f32]>>> {
        None
    }
}

/// Ausgabe einer Remote-Spur
pub trait Wiedergabe: Send {
    /// Schaltet die Ausgabe stumm (Deafen)
    fn stumm_setzen(&mut self, stumm: bool);

    /// Entfernt die Ausgabe; mehrfach aufrufbar
    fn entfernen(&mut self);
}

/// Medienverbindung zu genau einem Remote-Teilnehmer
#[async_trait]
pub trait PeerVerbindung: Send {
    /// Haengt die lokalen Spuren an (vor dem ersten Offer/Answer)
    fn spuren_anhaengen(&mut self, stream: Arc<dyn MediaStream>);

    async fn angebot_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung>;

    async fn antwort_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung>;

    async fn lokale_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()>;

    async fn remote_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()>;

    async fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> VoiceResult<()>;

    /// Schliesst die Verbindung
    ///
    /// Wird aus mehreren ueberlappenden Pfaden aufgerufen und darf weder
    /// fehlschlagen noch beim zweiten Aufruf etwas tun.
    fn schliessen(&mut self);
}

/// Parameter fuer eine neue Peer-Verbindung
pub struct VerbindungsAnfrage {
    pub lokal: UserId,
    pub remote: UserId,
    pub rolle: Rolle,
    pub ice_server: Vec<String>,
    pub ereignisse: PeerEreignisSender,
}

/// Medien-Stack einer Session
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    /// Oeffnet das lokale Mikrofon
    async fn mikrofon_oeffnen(&self) -> VoiceResult<Arc<dyn MediaStream>>;

    /// Erstellt eine Peer-Verbindung; Ereignisse gehen an `anfrage.ereignisse`
    async fn verbindung_erstellen(
        &self,
        anfrage: VerbindungsAnfrage,
    ) -> VoiceResult<Box<dyn PeerVerbindung>>;

    /// Erstellt eine Ausgabe fuer eine eingetroffene Remote-Spur
    fn wiedergabe_erstellen(
        &self,
        remote: UserId,
        stream: Arc<dyn MediaStream>,
        stumm: bool,
    ) -> Box<dyn Wiedergabe>;
}

// ---------------------------------------------------------------------------
// PeerEreignis
// ---------------------------------------------------------------------------

/// Asynchrone Rueckmeldung einer Peer-Verbindung
pub struct PeerEreignis {
    pub remote: UserId,
    /// Generation der Verbindung; Ereignisse ersetzter Verbindungen werden verworfen
    pub generation: u64,
    pub art: PeerEreignisArt,
}

pub enum PeerEreignisArt {
    IceKandidatGefunden(IceKandidat),
    SpurEingetroffen(Arc<dyn MediaStream>),
    VerbindungFehlgeschlagen(String),
}

impl PeerEreignisArt {
    /// Kurzname fuer Logs
    pub fn name(&self) -> &'static str {
        match self {
            PeerEreignisArt::IceKandidatGefunden(_) => "ice-kandidat",
            PeerEreignisArt::SpurEingetroffen(_) => "spur",
            PeerEreignisArt::VerbindungFehlgeschlagen(_) => "fehlgeschlagen",
        }
    }
}

/// Absender fuer die Ereignisse genau einer Verbindung
///
/// Traegt Remote-Id und Generation, damit das Backend sie nicht kennen muss.
#[derive(Clone)]
pub struct PeerEreignisSender {
    remote: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEreignis>,
}

impl PeerEreignisSender {
    pub fn neu(remote: UserId, generation: u64, tx: mpsc::UnboundedSender<PeerEreignis>) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> UserId {
        self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ice_kandidat(&self, kandidat: IceKandidat) {
        self.senden(PeerEreignisArt::IceKandidatGefunden(kandidat));
    }

    pub fn spur(&self, stream: Arc<dyn MediaStream>) {
        self.senden(PeerEreignisArt::SpurEingetroffen(stream));
    }

    pub fn fehlgeschlagen(&self, grund: impl Into<String>) {
        self.senden(PeerEreignisArt::VerbindungFehlgeschlagen(grund.into()));
    }

    fn senden(&self, art: PeerEreignisArt) {
        // Session bereits beendet: Ereignis hat keinen Empfaenger mehr
        let _ = self.tx.send(PeerEreignis {
            remote: self.remote,
            generation: self.generation,
            art,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_traegt_remote_und_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = UserId::new();
        let sender = PeerEreignisSender::neu(remote, 7, tx);

        sender.ice_kandidat(IceKandidat::neu("candidate:1"));
        sender.fehlgeschlagen("ICE abgebrochen");

        let erstes = rx.try_recv().unwrap();
        assert_eq!(erstes.remote, remote);
        assert_eq!(erstes.generation, 7);
        assert_eq!(erstes.art.name(), "ice-kandidat");

        let zweites = rx.try_recv().unwrap();
        assert!(matches!(
            zweites.art,
            PeerEreignisArt::VerbindungFehlgeschlagen(ref g) if g == "ICE abgebrochen"
        ));
    }

    #[test]
    fn senden_ohne_empfaenger_ist_harmlos() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = PeerEreignisSender::neu(UserId::new(), 1, tx);
        sender.fehlgeschlagen("egal");
    }
}
