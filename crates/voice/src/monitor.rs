//! Pegel-Monitor – Klassifiziert Quellen als sprechend/stumm
//!
//! Jeder Tick tastet alle registrierten Streams ab, bildet die mittlere
//! Spektrumsenergie und vergleicht sie mit einer festen Schwelle. Keine
//! Hysterese, keine Glaettung. Die lokale Quelle zaehlt bei aktivem Mute
//! nie als sprechend, auch wenn das Mikrofon Umgebungsgeraeusche liefert.

use kristal_core::types::UserId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::analyse::SpektrumAnalysator;
use crate::media::MediaStream;

/// Schluessel einer abgetasteten Quelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PegelQuelle {
    /// Eigenes Mikrofon (unter der lokalen UserId gefuehrt)
    Lokal,
    /// Eingetroffene Spur eines Remote-Teilnehmers
    Remote(UserId),
}

impl PegelQuelle {
    fn user_id(&self, lokal: UserId) -> UserId {
        match self {
            PegelQuelle::Lokal => lokal,
            PegelQuelle::Remote(remote) => *remote,
        }
    }
}

/// Sprecher-Erkennung ueber alle Quellen einer Session
pub struct AudioLevelMonitor {
    analysator: SpektrumAnalysator,
    schwelle: f32,
    quellen: HashMap<PegelQuelle, Arc<dyn MediaStream>>,
    sprecher: BTreeSet<UserId>,
    puffer: Vec<f32>,
}

impl AudioLevelMonitor {
    pub fn neu(fft_groesse: usize, schwelle: f32) -> Self {
        let analysator = SpektrumAnalysator::neu(fft_groesse);
        let puffer = vec![0.0; analysator.fft_groesse()];
        Self {
            analysator,
            schwelle,
            quellen: HashMap::new(),
            sprecher: BTreeSet::new(),
            puffer,
        }
    }

    /// Registriert (oder ersetzt) eine Quelle
    pub fn registrieren(&mut self, quelle: PegelQuelle, stream: Arc<dyn MediaStream>) {
        if self.quellen.insert(quelle, stream).is_some() {
            tracing::debug!(?quelle, "Pegel-Quelle ersetzt");
        }
    }

    /// Entfernt eine Quelle samt Sprecher-Eintrag
    ///
    /// Gibt `true` zurueck wenn sich die Sprecher-Menge geaendert hat.
    pub fn entfernen(&mut self, quelle: PegelQuelle, lokal: UserId) -> bool {
        self.quellen.remove(&quelle);
        self.sprecher.remove(&quelle.user_id(lokal))
    }

    /// Entfernt alle Quellen und leert die Sprecher-Menge
    pub fn leeren(&mut self) {
        self.quellen.clear();
        self.sprecher.clear();
    }

    /// Ein Abtast-Tick
    ///
    /// Gibt `true` zurueck wenn sich die Sprecher-Menge geaendert hat. Nur
    /// dann soll die Session benachrichtigen.
    pub fn abtasten(&mut self, lokal: UserId, stumm: bool) -> bool {
        let mut neu = BTreeSet::new();

        for (quelle, stream) in &self.quellen {
            if stumm && *quelle == PegelQuelle::Lokal {
                continue;
            }
            self.puffer.fill(0.0);
            let gelesen = stream.pcm_lesen(&mut self.puffer);
            let energie = self.analysator.mittlere_energie(&self.puffer[..gelesen]);
            if energie > self.schwelle {
                neu.insert(quelle.user_id(lokal));
            }
        }

        if neu == self.sprecher {
            return false;
        }
        tracing::trace!(vorher = self.sprecher.len(), nachher = neu.len(), "Sprecher geaendert");
        self.sprecher = neu;
        true
    }

    /// Aktuell sprechende Teilnehmer
    pub fn sprecher(&self) -> &BTreeSet<UserId> {
        &self.sprecher
    }

    pub fn quellen_anzahl(&self) -> usize {
        self.quellen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Teststream: Rauschen mit fester Amplitude
    struct TestStream {
        amplitude: Mutex<f32>,
    }

    impl TestStream {
        fn neu(amplitude: f32) -> Arc<Self> {
            Arc::new(Self {
                amplitude: Mutex::new(amplitude),
            })
        }
    }

    impl MediaStream for TestStream {
        fn spur_aktivieren(&self, _aktiv: bool) {}
        fn stoppen(&self) {}
        fn pcm_lesen(&self, puffer: &mut [f32]) -> usize {
            let a = *self.amplitude.lock();
            let mut zustand: u32 = 42;
            for s in puffer.iter_mut() {
                zustand = zustand.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                *s = ((zustand >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * a;
            }
            puffer.len()
        }
    }

    #[test]
    fn laute_quelle_spricht() {
        let mut monitor = AudioLevelMonitor::neu(256, 10.0);
        let lokal = UserId::new();
        let remote = UserId::new();

        monitor.registrieren(PegelQuelle::Lokal, TestStream::neu(0.0));
        monitor.registrieren(PegelQuelle::Remote(remote), TestStream::neu(0.5));

        assert!(monitor.abtasten(lokal, false));
        assert!(monitor.sprecher().contains(&remote));
        assert!(!monitor.sprecher().contains(&lokal));

        assert!(!monitor.abtasten(lokal, false), "Keine Aenderung -> kein Signal");
    }

    #[test]
    fn mute_unterdrueckt_lokale_quelle() {
        let mut monitor = AudioLevelMonitor::neu(256, 10.0);
        let lokal = UserId::new();
        monitor.registrieren(PegelQuelle::Lokal, TestStream::neu(0.5));

        assert!(!monitor.abtasten(lokal, true));
        assert!(monitor.sprecher().is_empty());

        assert!(monitor.abtasten(lokal, false));
        assert!(monitor.sprecher().contains(&lokal));

        assert!(monitor.abtasten(lokal, true));
        assert!(monitor.sprecher().is_empty());
    }

    #[test]
    fn entfernen_raeumt_sprecher_auf() {
        let mut monitor = AudioLevelMonitor::neu(256, 10.0);
        let lokal = UserId::new();
        let remote = UserId::new();
        monitor.registrieren(PegelQuelle::Remote(remote), TestStream::neu(0.5));
        monitor.abtasten(lokal, false);

        assert!(monitor.entfernen(PegelQuelle::Remote(remote), lokal));
        assert!(monitor.sprecher().is_empty());
        assert_eq!(monitor.quellen_anzahl(), 0);
        assert!(!monitor.entfernen(PegelQuelle::Remote(remote), lokal));
    }

    #[test]
    fn leeren_entfernt_alles() {
        let mut monitor = AudioLevelMonitor::neu(256, 10.0);
        let lokal = UserId::new();
        monitor.registrieren(PegelQuelle::Lokal, TestStream::neu(0.5));
        monitor.registrieren(PegelQuelle::Remote(UserId::new()), TestStream::neu(0.5));
        monitor.abtasten(lokal, false);

        monitor.leeren();
        assert_eq!(monitor.quellen_anzahl(), 0);
        assert!(monitor.sprecher().is_empty());
    }
}
