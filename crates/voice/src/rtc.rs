//! WebRTC-Backend – echte Peer-Verbindungen ueber webrtc-rs
//!
//! Jede [`PeerVerbindung`] kapselt eine `RTCPeerConnection` mit genau einer
//! lokalen Opus-Spur. Die Callbacks des Stacks werden als `PeerEreignis` an
//! den Session-Task weitergereicht:
//!
//! ```text
//! on_ice_candidate               -> IceKandidatGefunden
//! on_track                       -> SpurEingetroffen (PcmQuelle, per Opus dekodiert)
//! on_peer_connection_state_change -> VerbindungFehlgeschlagen (nur bei Failed)
//! ```
//!
//! Mikrofon und Lautsprecher laufen ueber cpal in eigenen Threads (Modul
//! `geraete`, Feature `geraete`). Ohne Geraete liefert das Backend ein
//! stilles Mikrofon und stumme Wiedergaben, die Verhandlung bleibt echt.

use async_trait::async_trait;
use bytes::Bytes;
use kristal_core::types::UserId;
use kristal_protocol::{BeschreibungsTyp, IceKandidat, SitzungsBeschreibung};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{VoiceError, VoiceResult};
use crate::media::{
    MediaBackend, MediaStream, PeerEreignisSender, PeerVerbindung, VerbindungsAnfrage, Wiedergabe,
};

/// Abtastrate aller Quellen und Ausgaben in Hz
pub const ABTASTRATE: u32 = 48_000;

/// Samples pro Frame (20 ms Mono bei 48 kHz)
pub const FRAME_SAMPLES: usize = 960;

/// Dauer eines Frames
pub const FRAME_DAUER: Duration = Duration::from_millis(20);

/// Analysefenster einer Quelle in Samples
const FENSTER_SAMPLES: usize = 4096;

/// Gepufferte Frames pro Abonnent
const FRAME_KAPAZITAET: usize = 64;

const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

// ---------------------------------------------------------------------------
// PcmQuelle
// ---------------------------------------------------------------------------

/// Sample-Strom einer Quelle: lokales Mikrofon oder dekodierte Remote-Spur
///
/// Eingespeiste Frames landen im Analysefenster (fuer den Pegel-Monitor) und
/// gehen an alle Abonnenten (Sender und Wiedergaben). Bei deaktivierter Spur
/// bekommen die Abonnenten Stille, das Fenster bleibt die Rohaufnahme.
pub struct PcmQuelle {
    fenster: Mutex<VecDeque<f32>>,
    frames: broadcast::Sender<Arc<[f32]>>,
    aktiv: AtomicBool,
    gestoppt: AtomicBool,
}

impl PcmQuelle {
    pub fn neu() -> Self {
        let (frames, _) = broadcast::channel(FRAME_KAPAZITAET);
        Self {
            fenster: Mutex::new(VecDeque::with_capacity(FENSTER_SAMPLES)),
            frames,
            aktiv: AtomicBool::new(true),
            gestoppt: AtomicBool::new(false),
        }
    }

    /// Nimmt einen Frame auf; nach `stoppen` wirkungslos
    pub fn einspeisen(&self, samples: &[f32]) {
        if self.ist_gestoppt() {
            return;
        }
        {
            let mut fenster = self.fenster.lock();
            fenster.extend(samples.iter().copied());
            let ueberschuss = fenster.len().saturating_sub(FENSTER_SAMPLES);
            fenster.drain(..ueberschuss);
        }

        let frame: Arc<[f32]> = if self.aktiv.load(Ordering::Acquire) {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0; samples.len()])
        };
        // Keine Abonnenten: Frame wird nur analysiert
        let _ = self.frames.send(frame);
    }

    pub fn ist_gestoppt(&self) -> bool {
        self.gestoppt.load(Ordering::Acquire)
    }
}

impl Default for PcmQuelle {
    fn default() -> Self {
        Self::neu()
    }
}

impl MediaStream for PcmQuelle {
    fn spur_aktivieren(&self, aktiv: bool) {
        self.aktiv.store(aktiv, Ordering::Release);
    }

    fn stoppen(&self) {
        if !self.gestoppt.swap(true, Ordering::AcqRel) {
            self.fenster.lock().clear();
            tracing::debug!("PCM-Quelle gestoppt");
        }
    }

    fn pcm_lesen(&self, puffer: &mut [f32]) -> usize {
        let fenster = self.fenster.lock();
        let anzahl = fenster.len().min(puffer.len());
        let luecke = puffer.len() - anzahl;
        puffer[..luecke].fill(0.0);
        for (ziel, sample) in puffer[luecke..]
            .iter_mut()
            .zip(fenster.iter().skip(fenster.len() - anzahl))
        {
            *ziel = *sample;
        }
        puffer.len()
    }

    fn pcm_abonnieren(&self) -> Option<broadcast::Receiver<Arc<[f32]>>> {
        Some(self.frames.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Wiedergabe
// ---------------------------------------------------------------------------

/// Gemeinsame Flags zwischen Wiedergabe-Handle und Ausgabe-Thread
#[derive(Default)]
pub(crate) struct WiedergabeSteuerung {
    pub(crate) stumm: AtomicBool,
    pub(crate) beendet: AtomicBool,
}

impl WiedergabeSteuerung {
    pub(crate) fn ist_stumm(&self) -> bool {
        self.stumm.load(Ordering::Acquire)
    }

    pub(crate) fn ist_beendet(&self) -> bool {
        self.beendet.load(Ordering::Acquire)
    }
}

/// Lautsprecher-Ausgabe einer Remote-Spur
pub struct RtcWiedergabe {
    remote: UserId,
    steuerung: Arc<WiedergabeSteuerung>,
}

impl RtcWiedergabe {
    pub fn ist_stumm(&self) -> bool {
        self.steuerung.ist_stumm()
    }
}

impl Wiedergabe for RtcWiedergabe {
    fn stumm_setzen(&mut self, stumm: bool) {
        self.steuerung.stumm.store(stumm, Ordering::Release);
    }

    fn entfernen(&mut self) {
        if !self.steuerung.beendet.swap(true, Ordering::AcqRel) {
            tracing::debug!(remote = %self.remote, "Wiedergabe entfernt");
        }
    }
}

impl Drop for RtcWiedergabe {
    fn drop(&mut self) {
        self.entfernen();
    }
}

// ---------------------------------------------------------------------------
// RtcVerbindung
// ---------------------------------------------------------------------------

/// Peer-Verbindung auf Basis einer `RTCPeerConnection`
pub struct RtcVerbindung {
    remote: UserId,
    verbindung: Arc<RTCPeerConnection>,
    spur: Arc<TrackLocalStaticSample>,
    aufgaben: Vec<JoinHandle<()>>,
    geschlossen: bool,
}

impl RtcVerbindung {
    fn fehler(&self, kontext: &str, e: webrtc::Error) -> VoiceError {
        VoiceError::verhandlung(self.remote, format!("{kontext}: {e}"))
    }

    /// Aktuelle lokale Beschreibung, falls gesetzt
    pub async fn lokale_beschreibung(&self) -> Option<SitzungsBeschreibung> {
        let beschreibung = self.verbindung.local_description().await?;
        beschreibung_von_rtc(&beschreibung)
    }

    /// Aktuelle Remote-Beschreibung, falls gesetzt
    pub async fn remote_beschreibung(&self) -> Option<SitzungsBeschreibung> {
        let beschreibung = self.verbindung.remote_description().await?;
        beschreibung_von_rtc(&beschreibung)
    }
}

#[async_trait]
impl PeerVerbindung for RtcVerbindung {
    fn spuren_anhaengen(&mut self, stream: Arc<dyn MediaStream>) {
        let Some(frames) = stream.pcm_abonnieren() else {
            tracing::debug!(remote = %self.remote, "Quelle ohne Sample-Strom, Spur bleibt leer");
            return;
        };
        if let Some(aufgabe) = sender_starten(self.remote, Arc::clone(&self.spur), frames) {
            self.aufgaben.push(aufgabe);
        }
    }

    async fn angebot_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung> {
        let angebot = self
            .verbindung
            .create_offer(None)
            .await
            .map_err(|e| self.fehler("Offer erstellen", e))?;
        Ok(SitzungsBeschreibung::offer(angebot.sdp))
    }

    async fn antwort_erstellen(&mut self) -> VoiceResult<SitzungsBeschreibung> {
        let antwort = self
            .verbindung
            .create_answer(None)
            .await
            .map_err(|e| self.fehler("Answer erstellen", e))?;
        Ok(SitzungsBeschreibung::answer(antwort.sdp))
    }

    async fn lokale_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()> {
        let beschreibung = beschreibung_zu_rtc(beschreibung)?;
        self.verbindung
            .set_local_description(beschreibung)
            .await
            .map_err(|e| self.fehler("Lokale Beschreibung setzen", e))
    }

    async fn remote_beschreibung_setzen(
        &mut self,
        beschreibung: SitzungsBeschreibung,
    ) -> VoiceResult<()> {
        let beschreibung = beschreibung_zu_rtc(beschreibung)?;
        self.verbindung
            .set_remote_description(beschreibung)
            .await
            .map_err(|e| self.fehler("Remote-Beschreibung setzen", e))
    }

    async fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> VoiceResult<()> {
        let init = RTCIceCandidateInit {
            candidate: kandidat.candidate,
            sdp_mid: kandidat.sdp_mid,
            sdp_mline_index: kandidat.sdp_m_line_index,
            ..Default::default()
        };
        self.verbindung
            .add_ice_candidate(init)
            .await
            .map_err(|e| self.fehler("ICE-Kandidat hinzufuegen", e))
    }

    fn schliessen(&mut self) {
        if self.geschlossen {
            return;
        }
        self.geschlossen = true;
        for aufgabe in self.aufgaben.drain(..) {
            aufgabe.abort();
        }

        // close() ist async; ausserhalb einer Runtime bleibt nur der Drop
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let verbindung = Arc::clone(&self.verbindung);
            let remote = self.remote;
            runtime.spawn(async move {
                if let Err(e) = verbindung.close().await {
                    tracing::debug!(remote = %remote, fehler = %e, "Schliessen der Verbindung fehlgeschlagen");
                }
            });
        }
        tracing::debug!(remote = %self.remote, "WebRTC-Verbindung geschlossen");
    }
}

impl Drop for RtcVerbindung {
    fn drop(&mut self) {
        self.schliessen();
    }
}

fn beschreibung_zu_rtc(beschreibung: SitzungsBeschreibung) -> VoiceResult<RTCSessionDescription> {
    let ergebnis = match beschreibung.typ {
        BeschreibungsTyp::Offer => RTCSessionDescription::offer(beschreibung.sdp),
        BeschreibungsTyp::Answer => RTCSessionDescription::answer(beschreibung.sdp),
    };
    ergebnis.map_err(|e| VoiceError::UngueltigeBeschreibung(e.to_string()))
}

fn beschreibung_von_rtc(beschreibung: &RTCSessionDescription) -> Option<SitzungsBeschreibung> {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    match beschreibung.sdp_type {
        RTCSdpType::Offer => Some(SitzungsBeschreibung::offer(beschreibung.sdp.clone())),
        RTCSdpType::Answer => Some(SitzungsBeschreibung::answer(beschreibung.sdp.clone())),
        _ => None,
    }
}

fn ice_kandidat_von_rtc(kandidat: &RTCIceCandidate) -> Option<IceKandidat> {
    match kandidat.to_json() {
        Ok(init) => Some(IceKandidat {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
        }),
        Err(e) => {
            tracing::warn!(fehler = %e, "ICE-Kandidat nicht serialisierbar");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Sende- und Empfangspfad
// ---------------------------------------------------------------------------

/// Kodiert die Frames einer Quelle und schreibt sie auf die lokale Spur
#[cfg(feature = "geraete")]
fn sender_starten(
    remote: UserId,
    spur: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<Arc<[f32]>>,
) -> Option<JoinHandle<()>> {
    use crate::geraete::OpusKodierer;

    let mut kodierer = match OpusKodierer::neu() {
        Ok(k) => k,
        Err(e) => {
            tracing::warn!(remote = %remote, fehler = %e, "Opus-Encoder nicht verfuegbar, Spur bleibt leer");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(verpasst)) => {
                    tracing::trace!(remote = %remote, verpasst, "Sender hinkt hinterher");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let paket = match kodierer.kodieren(&frame) {
                Ok(paket) => paket,
                Err(e) => {
                    tracing::debug!(remote = %remote, fehler = %e, "Frame nicht kodiert");
                    continue;
                }
            };
            let sample = Sample {
                data: Bytes::from(paket),
                duration: FRAME_DAUER,
                ..Default::default()
            };
            if let Err(e) = spur.write_sample(&sample).await {
                tracing::debug!(remote = %remote, fehler = %e, "Sendepfad beendet");
                break;
            }
        }
    }))
}

#[cfg(not(feature = "geraete"))]
fn sender_starten(
    remote: UserId,
    _spur: Arc<TrackLocalStaticSample>,
    _frames: broadcast::Receiver<Arc<[f32]>>,
) -> Option<JoinHandle<()>> {
    tracing::debug!(remote = %remote, "Ohne Opus gebaut, Spur bleibt leer");
    None
}

/// Liest RTP-Pakete einer Remote-Spur und speist sie dekodiert in `quelle`
async fn empfangen(remote: UserId, spur: Arc<TrackRemote>, quelle: Arc<PcmQuelle>) {
    #[cfg(feature = "geraete")]
    let mut dekodierer = match crate::geraete::OpusDekodierer::neu() {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(remote = %remote, fehler = %e, "Opus-Decoder nicht verfuegbar");
            None
        }
    };

    loop {
        let paket = match spur.read_rtp().await {
            Ok((paket, _)) => paket,
            Err(e) => {
                tracing::debug!(remote = %remote, fehler = %e, "Empfangspfad beendet");
                break;
            }
        };
        if quelle.ist_gestoppt() {
            break;
        }

        #[cfg(feature = "geraete")]
        if let Some(dekodierer) = dekodierer.as_mut() {
            match dekodierer.dekodieren(&paket.payload) {
                Ok(pcm) => quelle.einspeisen(&pcm),
                Err(e) => tracing::trace!(remote = %remote, fehler = %e, "Paket nicht dekodiert"),
            }
        }
        #[cfg(not(feature = "geraete"))]
        let _ = paket;
    }
}

// ---------------------------------------------------------------------------
// WebRtcBackend
// ---------------------------------------------------------------------------

/// Medien-Stack mit webrtc-rs und (optional) cpal-Geraeten
#[derive(Debug, Clone)]
pub struct WebRtcBackend {
    geraete: bool,
}

impl WebRtcBackend {
    /// Backend mit Mikrofon und Lautsprecher des Standard-Hosts
    pub fn neu() -> Self {
        Self {
            geraete: cfg!(feature = "geraete"),
        }
    }

    /// Backend ohne Audio-Geraete: stilles Mikrofon, stumme Wiedergaben
    pub fn ohne_geraete() -> Self {
        Self { geraete: false }
    }

    pub fn hat_geraete(&self) -> bool {
        self.geraete
    }

    async fn verbindung_aufbauen(
        &self,
        ice_server: &[String],
    ) -> VoiceResult<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| VoiceError::MedienZugriff(format!("Codecs registrieren: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| VoiceError::MedienZugriff(format!("Interceptors registrieren: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_server
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        api.new_peer_connection(config)
            .await
            .map_err(|e| VoiceError::MedienZugriff(format!("Peer-Verbindung erstellen: {e}")))
    }
}

impl Default for WebRtcBackend {
    fn default() -> Self {
        Self::neu()
    }
}

impl WebRtcBackend {
    /// Erstellt die Verbindung samt lokaler Opus-Spur und Callbacks
    pub async fn verbindung_oeffnen(&self, anfrage: VerbindungsAnfrage) -> VoiceResult<RtcVerbindung> {
        let VerbindungsAnfrage {
            lokal,
            remote,
            rolle,
            ice_server,
            ereignisse,
        } = anfrage;
        let verbindung = Arc::new(self.verbindung_aufbauen(&ice_server).await?);

        let spur = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: ABTASTRATE,
                channels: 2,
                sdp_fmtp_line: OPUS_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            format!("audio-{lokal}"),
            format!("kristal-{lokal}"),
        ));
        let sender = verbindung
            .add_track(Arc::clone(&spur) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| VoiceError::verhandlung(remote, format!("Spur anhaengen: {e}")))?;

        // RTCP der Gegenseite lesen, sonst laufen die Interceptors nicht
        let rtcp = tokio::spawn(async move {
            let mut puffer = vec![0u8; 1500];
            while sender.read(&mut puffer).await.is_ok() {}
        });

        callbacks_registrieren(&verbindung, ereignisse);

        tracing::debug!(remote = %remote, rolle = ?rolle, "WebRTC-Verbindung erstellt");
        Ok(RtcVerbindung {
            remote,
            verbindung,
            spur,
            aufgaben: vec![rtcp],
            geschlossen: false,
        })
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn mikrofon_oeffnen(&self) -> VoiceResult<Arc<dyn MediaStream>> {
        let quelle = Arc::new(PcmQuelle::neu());
        #[cfg(feature = "geraete")]
        if self.geraete {
            crate::geraete::aufnahme_starten(Arc::clone(&quelle)).await?;
            return Ok(quelle);
        }
        tracing::debug!("Backend ohne Geraete, Mikrofon bleibt still");
        Ok(quelle)
    }

    async fn verbindung_erstellen(
        &self,
        anfrage: VerbindungsAnfrage,
    ) -> VoiceResult<Box<dyn PeerVerbindung>> {
        Ok(Box::new(self.verbindung_oeffnen(anfrage).await?))
    }

    fn wiedergabe_erstellen(
        &self,
        remote: UserId,
        stream: Arc<dyn MediaStream>,
        stumm: bool,
    ) -> Box<dyn Wiedergabe> {
        let steuerung = Arc::new(WiedergabeSteuerung::default());
        steuerung.stumm.store(stumm, Ordering::Release);

        #[cfg(feature = "geraete")]
        if self.geraete {
            if let Some(frames) = stream.pcm_abonnieren() {
                crate::geraete::wiedergabe_starten(remote, frames, Arc::clone(&steuerung));
            }
        }
        #[cfg(not(feature = "geraete"))]
        let _ = stream;

        Box::new(RtcWiedergabe { remote, steuerung })
    }
}

/// Verdrahtet die Callbacks einer Verbindung mit dem Ereignis-Sender
fn callbacks_registrieren(verbindung: &RTCPeerConnection, ereignisse: PeerEreignisSender) {
    let ice = ereignisse.clone();
    verbindung.on_ice_candidate(Box::new(move |kandidat: Option<RTCIceCandidate>| {
        let ice = ice.clone();
        Box::pin(async move {
            // None markiert das Ende der Kandidatensuche
            let Some(kandidat) = kandidat else { return };
            if let Some(kandidat) = ice_kandidat_von_rtc(&kandidat) {
                ice.ice_kandidat(kandidat);
            }
        })
    }));

    let spuren = ereignisse.clone();
    verbindung.on_track(Box::new(move |spur: Arc<TrackRemote>, _empfaenger, _transceiver| {
        let spuren = spuren.clone();
        Box::pin(async move {
            let remote = spuren.remote();
            tracing::debug!(remote = %remote, "Remote-Spur eingetroffen");
            let quelle = Arc::new(PcmQuelle::neu());
            spuren.spur(Arc::clone(&quelle) as Arc<dyn MediaStream>);
            tokio::spawn(empfangen(remote, spur, quelle));
        })
    }));

    let zustand = ereignisse;
    verbindung.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let zustand = zustand.clone();
        Box::pin(async move {
            tracing::trace!(remote = %zustand.remote(), zustand = %s, "Verbindungszustand");
            if s == RTCPeerConnectionState::Failed {
                zustand.fehlgeschlagen("ICE-Verbindung fehlgeschlagen");
            }
        })
    }));
}
