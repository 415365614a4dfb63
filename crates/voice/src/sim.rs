//! Simulations-Backend – Medien-Stack ohne Geraete und ohne Netzwerk
//!
//! Alle Sessions eines Prozesses teilen ein [`SimMedienNetz`]. Es kennt die
//! Mikrofone und offenen Verbindungen aller Teilnehmer und spielt die
//! asynchronen Rueckmeldungen eines echten Stacks nach:
//!
//! - `lokale_beschreibung_setzen` meldet einen ICE-Kandidaten
//! - `remote_beschreibung_setzen` meldet die Spur der Gegenseite, sofern
//!   diese ihre Verbindung offen und Spuren angehaengt hat
//!
//! Fehler lassen sich pro Teilnehmer einschleusen (Mikrofon, Verhandlung,
//! fehlende Spur, Verbindungsabbruch).

use async_trait::async_trait;
use kristal_core::types::UserId;
use kristal_protocol::{BeschreibungsTyp, IceKandidat, SitzungsBeschreibung};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{VoiceError, VoiceResult};
use crate::media::{
    MediaBackend, MediaStream, PeerEreignisSender, PeerVerbindung, Rolle, VerbindungsAnfrage,
    Wiedergabe,
};

const SDP_PRAEFIX: &str = "sim:";

// ---------------------------------------------------------------------------
// SimStream
// ---------------------------------------------------------------------------

/// Simuliertes Mikrofon: breitbandiges Testsignal mit einstellbarem Pegel
///
/// Die Rohaufnahme ignoriert das Aktiv-Flag (ein Mikrofon hoert auch bei
/// deaktivierter Spur weiter). Erst die Remote-Sicht ([`SimSpur`]) liefert
/// bei deaktivierter Spur Stille.
pub struct SimStream {
    pegel: Mutex<f32>,
    zufall: Mutex<u32>,
    aktiv: AtomicBool,
    gestoppt: AtomicBool,
}

impl SimStream {
    pub fn neu(pegel: f32, saat: u32) -> Self {
        Self {
            pegel: Mutex::new(pegel),
            zufall: Mutex::new(saat | 1),
            aktiv: AtomicBool::new(true),
            gestoppt: AtomicBool::new(false),
        }
    }

    /// Setzt die Amplitude (0.0 = Stille, 1.0 = Vollaussteuerung)
    pub fn pegel_setzen(&self, pegel: f32) {
        *self.pegel.lock() = pegel.clamp(0.0, 1.0);
    }

    pub fn ist_aktiv(&self) -> bool {
        self.aktiv.load(Ordering::Acquire)
    }

    pub fn ist_gestoppt(&self) -> bool {
        self.gestoppt.load(Ordering::Acquire)
    }
}

impl MediaStream for SimStream {
    fn spur_aktivieren(&self, aktiv: bool) {
        self.aktiv.store(aktiv, Ordering::Release);
    }

    fn stoppen(&self) {
        if !self.gestoppt.swap(true, Ordering::AcqRel) {
            tracing::debug!("Simuliertes Mikrofon gestoppt");
        }
    }

    fn pcm_lesen(&self, puffer: &mut [f32]) -> usize {
        if self.ist_gestoppt() {
            puffer.fill(0.0);
            return puffer.len();
        }
        let pegel = *self.pegel.lock();
        let mut zustand = self.zufall.lock();
        for sample in puffer.iter_mut() {
            *zustand = zustand.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let normiert = (*zustand >> 8) as f32 / (1u32 << 24) as f32;
            *sample = (normiert * 2.0 - 1.0) * pegel;
        }
        puffer.len()
    }
}

/// Empfangsseite einer simulierten Spur
struct SimSpur {
    quelle: Arc<SimStream>,
}

impl MediaStream for SimSpur {
    fn spur_aktivieren(&self, _aktiv: bool) {}

    fn stoppen(&self) {}

    fn pcm_lesen(&self, puffer: &mut [f32]) -> usize {
        if !self.quelle.ist_aktiv() || self.quelle.ist_gestoppt() {
            puffer.fill(0.0);
            return puffer.len();
        }
        self.quelle.pcm_lesen(puffer)
    }
}

// ---------------------------------------------------------------------------
// SimMedienNetz
// ---------------------------------------------------------------------------

struct VerbindungsEintrag {
    id: u64,
    spuren_angehaengt: bool,
    ereignisse: PeerEreignisSender,
}

struct WiedergabeEintrag {
    id: u64,
    stumm: bool,
}

#[derive(Default)]
struct NetzInner {
    naechste_id: u64,
    /// Offene Verbindungen, Schluessel (lokal, remote)
    verbindungen: HashMap<(UserId, UserId), VerbindungsEintrag>,
    /// Aktive Ausgaben, Schluessel (lokal, remote)
    wiedergaben: HashMap<(UserId, UserId), WiedergabeEintrag>,
    mikrofone: HashMap<UserId, Arc<SimStream>>,
    pegel: HashMap<UserId, f32>,
    kandidaten: HashMap<(UserId, UserId), usize>,
    mikrofon_fehler: HashSet<UserId>,
    verhandlungsfehler: HashSet<UserId>,
    spur_unterdrueckt: HashSet<UserId>,
}

impl NetzInner {
    fn id_vergeben(&mut self) -> u64 {
        self.naechste_id += 1;
        self.naechste_id
    }

    fn verhandlung_gestoert(&self, lokal: UserId, remote: UserId) -> bool {
        self.verhandlungsfehler.contains(&lokal) || self.verhandlungsfehler.contains(&remote)
    }
}

/// Gemeinsames Simulationsnetz aller Sessions eines Prozesses
#[derive(Clone, Default)]
pub struct SimMedienNetz {
    inner: Arc<Mutex<NetzInner>>,
}

impl SimMedienNetz {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Backend fuer die Session von `user`
    pub fn backend(&self, user: UserId) -> SimBackend {
        SimBackend {
            netz: self.clone(),
            user,
        }
    }

    // -- Fehlerinjektion ----------------------------------------------------

    /// Mikrofon von `user` schlaegt beim naechsten Oeffnen fehl
    pub fn mikrofon_fehler_setzen(&self, user: UserId, fehler: bool) {
        mengen_flag(&mut self.inner.lock().mikrofon_fehler, user, fehler);
    }

    /// Jede Verhandlung mit Beteiligung von `user` schlaegt fehl
    pub fn verhandlungsfehler_setzen(&self, user: UserId, fehler: bool) {
        mengen_flag(&mut self.inner.lock().verhandlungsfehler, user, fehler);
    }

    /// Verhandlungen mit `user` laufen durch, die Spur trifft aber nie ein
    pub fn spur_unterdruecken(&self, user: UserId, unterdrueckt: bool) {
        mengen_flag(&mut self.inner.lock().spur_unterdrueckt, user, unterdrueckt);
    }

    /// Meldet allen Verbindungen mit Beteiligung von `user` einen Abbruch
    pub fn verbindungsabbruch(&self, user: UserId) -> usize {
        let betroffene: Vec<PeerEreignisSender> = {
            let inner = self.inner.lock();
            inner
                .verbindungen
                .iter()
                .filter(|((lokal, remote), _)| *lokal == user || *remote == user)
                .map(|(_, eintrag)| eintrag.ereignisse.clone())
                .collect()
        };
        for ereignisse in &betroffene {
            ereignisse.fehlgeschlagen("ICE-Verbindung abgebrochen");
        }
        betroffene.len()
    }

    // -- Steuerung und Beobachtung -------------------------------------------

    /// Setzt den Mikrofonpegel von `user`, auch fuer spaeter geoeffnete Mikrofone
    pub fn pegel_setzen(&self, user: UserId, pegel: f32) {
        let mut inner = self.inner.lock();
        inner.pegel.insert(user, pegel);
        if let Some(mikrofon) = inner.mikrofone.get(&user) {
            mikrofon.pegel_setzen(pegel);
        }
    }

    /// Zuletzt geoeffnetes Mikrofon von `user`
    pub fn mikrofon(&self, user: UserId) -> Option<Arc<SimStream>> {
        self.inner.lock().mikrofone.get(&user).cloned()
    }

    /// Anzahl offener Verbindungen, die `user` haelt
    pub fn offene_verbindungen(&self, user: UserId) -> usize {
        self.inner
            .lock()
            .verbindungen
            .keys()
            .filter(|(lokal, _)| *lokal == user)
            .count()
    }

    pub fn hat_verbindung(&self, lokal: UserId, remote: UserId) -> bool {
        self.inner.lock().verbindungen.contains_key(&(lokal, remote))
    }

    /// Anzahl aktiver Ausgaben von `user`
    pub fn offene_wiedergaben(&self, user: UserId) -> usize {
        self.inner
            .lock()
            .wiedergaben
            .keys()
            .filter(|(lokal, _)| *lokal == user)
            .count()
    }

    /// Stumm-Zustand der Ausgabe von `remote` bei `lokal`
    pub fn wiedergabe_stumm(&self, lokal: UserId, remote: UserId) -> Option<bool> {
        self.inner
            .lock()
            .wiedergaben
            .get(&(lokal, remote))
            .map(|w| w.stumm)
    }

    /// Von `lokal` empfangene ICE-Kandidaten fuer die Verbindung zu `remote`
    pub fn empfangene_kandidaten(&self, lokal: UserId, remote: UserId) -> usize {
        self.inner
            .lock()
            .kandidaten
            .get(&(lokal, remote))
            .copied()
            .unwrap_or(0)
    }
}

fn mengen_flag(menge: &mut HashSet<UserId>, user: UserId, gesetzt: bool) {
    if gesetzt {
        menge.insert(user);
    } else {
        menge.remove(&user);
    }
}

fn sdp_absender(beschreibung: &SitzungsBeschreibung) -> Option<UserId> {
    beschreibung
        .sdp
        .strip_prefix(SDP_PRAEFIX)
        .and_then(|rest| rest.parse().ok())
}

// ---------------------------------------------------------------------------
// SimBackend
// ---------------------------------------------------------------------------

/// [`MediaBackend`] einer einzelnen Session im Simulationsnetz
#[derive(Clone)]
pub struct SimBackend {
    netz: SimMedienNetz,
    user: UserId,
}

impl SimBackend {
    pub fn netz(&self) -> &SimMedienNetz {
        &self.netz
    }
}

#[async_trait]
impl MediaBackend for SimBackend {
    async fn mikrofon_oeffnen(&self) -> VoiceResult<Arc<dyn MediaStream>> {
        let mut inner = self.netz.inner.lock();
        if inner.mikrofon_fehler.contains(&self.user) {
            return Err(VoiceError::MedienZugriff(format!(
                "kein Eingabegeraet fuer {}",
                self.user
            )));
        }
        let pegel = inner.pegel.get(&self.user).copied().unwrap_or(0.0);
        let saat = self.user.inner().as_u128() as u32;
        let stream = Arc::new(SimStream::neu(pegel, saat));
        inner.mikrofone.insert(self.user, Arc::clone(&stream));
        tracing::debug!(user_id = %self.user, "Simuliertes Mikrofon geoeffnet");
        Ok(stream)
    }

    async fn verbindung_erstellen(
        &self,
        anfrage: VerbindungsAnfrage,
    ) -> VoiceResult<Box<dyn PeerVerbindung>> {
        let mut inner = self.netz.inner.lock();
        let id = inner.id_vergeben();
        inner.verbindungen.insert(
            (anfrage.lokal, anfrage.remote),
            VerbindungsEintrag {
                id,
                spuren_angehaengt: false,
                ereignisse: anfrage.ereignisse.clone(),
            },
        );
        Ok(Box::new(SimVerbindung {
            netz: self.netz.clone(),
            id,
            lokal: anfrage.lokal,
            remote: anfrage.remote,
            rolle: anfrage.rolle,
            ereignisse: anfrage.ereignisse,
            remote_beschreibung: None,
            geschlossen: false,
        }))
    }

    fn wiedergabe_erstellen(
        &self,
        remote: UserId,
        _stream: Arc<dyn MediaStream>,
        stumm: bool,
    ) -> Box<dyn Wiedergabe> {
        let mut inner = self.netz.inner.lock();
        let id = inner.id_vergeben();
        inner
            .wiedergaben
            .insert((self.user, remote), WiedergabeEintrag { id, stumm });
        Box::new(SimWiedergabe {
            netz: self.netz.clone(),
            id,
            lokal: self.user,
            remote,
            entfernt: false,
        })
    }
}

// ---------------------------------------------------------------------------
// SimVerbindung
// ---------------------------------------------------------------------------

struct SimVerbindung {
    netz: SimMedienNetz,
    id: u64,
    lokal: UserId,
    remote: UserId,
    rolle: Rolle,
    ereignisse: PeerEreignisSender,
    remote_beschreibung: Option<SitzungsBeschreibung>,
    geschlossen: bool,
}

impl SimVerbindung {
    fn offen_pruefen(&self) -> VoiceResult<()> {
        if self.geschlossen {
            return Err(VoiceError::verhandlung(self.remote, "Verbindung bereits geschlossen"));
        }
        Ok(())
    }

    fn stoerung_pruefen(&self) -> VoiceResult<()> {
        if self.netz.inner.lock().verhandlung_gestoert(self.lokal, self.remote) {
            return Err(VoiceError::verhandlung(self.remote, "simulierter Verhandlungsfehler"));
        }
        Ok(())
    }

    fn eigene_sdp(&self, typ: BeschreibungsTyp) -> SitzungsBeschreibung {
        SitzungsBeschreibung {
            typ,
            sdp: format!("{SDP_PRAEFIX}{}", self.lokal.inner()),
        }
    }

    /// Liefert die Spur der Gegenseite, falls deren Verbindung bereit ist
    fn spur_aufloesen(&self) -> Option<Arc<SimStream>> {
        let inner = self.netz.inner.lock();
        if inner.spur_unterdrueckt.contains(&self.remote)
            || inner.spur_unterdrueckt.contains(&self.lokal)
        {
            return None;
        }
        let gegenseite = inner.verbindungen.get(&(self.remote, self.lokal))?;
        if !gegenseite.spuren_angehaengt {
            return None;
        }
        inner.mikrofone.get(&self.remote).cloned()
    }
}

#[async_trait]
impl PeerVerbindung for SimVerbindung {
    fn spuren_anhaengen(&mut self, _stream: Arc<dyn MediaStream>) {
        let mut inner = self.netz.inner.lock();
        if let Some(eintrag) = inner.verbindungen.get_mut(&(self.lokal, self.remote)) {
            if eintrag.id == self.id {
                eintrag.spuren_angehaengt = true;
            }
        }
    }

    async fn angebot_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung> {
        self.offen_pruefen()?;
        self.stoerung_pruefen()?;
        Ok(self.eigene_sdp(BeschreibungsTyp::Offer))
    }

    async fn antwort_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung> {
        self.offen_pruefen()?;
        self.stoerung_pruefen()?;
        match &self.remote_beschreibung {
            Some(b) if b.typ == BeschreibungsTyp::Offer => {
                Ok(self.eigene_sdp(BeschreibungsTyp::Answer))
            }
            _ => Err(VoiceError::verhandlung(self.remote, "Answer ohne Remote-Offer")),
        }
    }

    async fn lokale_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()> {
        self.offen_pruefen()?;
        tracing::trace!(lokal = %self.lokal, remote = %self.remote, typ = ?beschreibung.typ, "Sim: lokale Beschreibung");
        self.ereignisse.ice_kandidat(IceKandidat {
            candidate: format!("candidate:sim {} udp {}", self.id, self.lokal.inner()),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        });
        Ok(())
    }

    async fn remote_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()> {
        self.offen_pruefen()?;
        self.stoerung_pruefen()?;

        let erwartet = match self.rolle {
            Rolle::Initiator => BeschreibungsTyp::Answer,
            Rolle::Responder => BeschreibungsTyp::Offer,
        };
        if beschreibung.typ != erwartet {
            return Err(VoiceError::UngueltigeBeschreibung(format!(
                "{:?} erwartet, {:?} erhalten",
                erwartet, beschreibung.typ
            )));
        }
        if sdp_absender(&beschreibung) != Some(self.remote) {
            return Err(VoiceError::UngueltigeBeschreibung(format!(
                "SDP '{}' stammt nicht von {}",
                beschreibung.sdp, self.remote
            )));
        }
        self.remote_beschreibung = Some(beschreibung);

        if let Some(quelle) = self.spur_aufloesen() {
            self.ereignisse.spur(Arc::new(SimSpur { quelle }));
        }
        Ok(())
    }

    async fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> VoiceResult<()> {
        self.offen_pruefen()?;
        tracing::trace!(lokal = %self.lokal, remote = %self.remote, kandidat = %kandidat.candidate, "Sim: ICE-Kandidat");
        *self
            .netz
            .inner
            .lock()
            .kandidaten
            .entry((self.lokal, self.remote))
            .or_insert(0) += 1;
        Ok(())
    }

    fn schliessen(&mut self) {
        if self.geschlossen {
            return;
        }
        self.geschlossen = true;
        let mut inner = self.netz.inner.lock();
        let schluessel = (self.lokal, self.remote);
        if inner.verbindungen.get(&schluessel).is_some_and(|e| e.id == self.id) {
            inner.verbindungen.remove(&schluessel);
            inner.kandidaten.remove(&schluessel);
        }
    }
}

impl Drop for SimVerbindung {
    fn drop(&mut self) {
        self.schliessen();
    }
}

// ---------------------------------------------------------------------------
// SimWiedergabe
// ---------------------------------------------------------------------------

struct SimWiedergabe {
    netz: SimMedienNetz,
    id: u64,
    lokal: UserId,
    remote: UserId,
    entfernt: bool,
}

impl Wiedergabe for SimWiedergabe {
    fn stumm_setzen(&mut self, stumm: bool) {
        if self.entfernt {
            return;
        }
        if let Some(eintrag) = self.netz.inner.lock().wiedergaben.get_mut(&(self.lokal, self.remote)) {
            if eintrag.id == self.id {
                eintrag.stumm = stumm;
            }
        }
    }

    fn entfernen(&mut self) {
        if self.entfernt {
            return;
        }
        self.entfernt = true;
        let mut inner = self.netz.inner.lock();
        let schluessel = (self.lokal, self.remote);
        if inner.wiedergaben.get(&schluessel).is_some_and(|w| w.id == self.id) {
            inner.wiedergaben.remove(&schluessel);
        }
    }
}

impl Drop for SimWiedergabe {
    fn drop(&mut self) {
        self.entfernen();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
