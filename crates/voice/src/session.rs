//! Voice-Session – Fassade fuer Join/Leave/Toggles und Zustandsbeobachtung
//!
//! ## Concurrency-Modell
//! Der gesamte Session-Zustand gehoert einem einzigen tokio-Task
//! ([`SessionTask`]). [`VoiceSession`] ist nur ein klonbarer Handle, der
//! Befehle per mpsc in diesen Task schickt und die Antwort per oneshot
//! abwartet. Der Task verarbeitet nacheinander:
//!
//! ```text
//! Befehle (Handle)        --mpsc-------+
//! Signaling-Bus           --broadcast--+--> select! --> SessionTask
//! Peer-Ereignisse         --mpsc-------+        |
//! Monitor-Takt (100 ms)   --interval---+        v
//!                                        watch::Sender + Zuhoerer
//! ```
//!
//! Jeder Zweig laeuft bis zum Ende, bevor der naechste beginnt. Locks auf
//! dem Session-Zustand gibt es daher keine.

use kristal_core::types::{ChannelId, ChannelTyp, UserId};
use kristal_protocol::SignalNachricht;
use kristal_signaling::{PresenceTracker, SignalingBus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{MediaBackend, MediaStream, PeerEreignis};
use crate::monitor::{AudioLevelMonitor, PegelQuelle};
use crate::peer::PeerManager;
use crate::state::{VerbindungsStatus, VoiceSessionState};

// ---------------------------------------------------------------------------
// Befehle und Zuhoerer
// ---------------------------------------------------------------------------

enum Befehl {
    Beitreten {
        channel_id: ChannelId,
        antwort: oneshot::Sender<VoiceResult<()>>,
    },
    Verlassen {
        antwort: oneshot::Sender<()>,
    },
    StummUmschalten {
        antwort: oneshot::Sender<bool>,
    },
    TaubUmschalten {
        antwort: oneshot::Sender<bool>,
    },
    VideoUmschalten {
        antwort: oneshot::Sender<bool>,
    },
    BildschirmUmschalten {
        antwort: oneshot::Sender<bool>,
    },
    Beenden {
        antwort: oneshot::Sender<()>,
    },
}

type Handler = Arc<dyn Fn(&VoiceSessionState) + Send + Sync>;

#[derive(Default)]
struct Zuhoerer {
    naechste_id: u64,
    handler: BTreeMap<u64, Handler>,
}

/// Registrierung eines Zustands-Handlers
///
/// Drop oder [`Abonnement::kuendigen`] meldet den Handler ab.
#[must_use = "Das Abonnement endet sobald der Wert gedroppt wird"]
pub struct Abonnement {
    id: u64,
    zuhoerer: Weak<Mutex<Zuhoerer>>,
}

impl Abonnement {
    /// Meldet den Handler ab
    pub fn kuendigen(self) {}
}

impl Drop for Abonnement {
    fn drop(&mut self) {
        if let Some(zuhoerer) = self.zuhoerer.upgrade() {
            zuhoerer.lock().handler.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// VoiceSession (Handle)
// ---------------------------------------------------------------------------

/// Handle auf eine laufende Voice-Session
///
/// Klone teilen dieselbe Session. Wird der letzte Handle gedroppt, verlaesst
/// die Session ihren Channel und der Task endet.
#[derive(Clone)]
pub struct VoiceSession {
    lokal: UserId,
    befehl_tx: mpsc::Sender<Befehl>,
    zustand_rx: watch::Receiver<VoiceSessionState>,
    zuhoerer: Arc<Mutex<Zuhoerer>>,
}

impl VoiceSession {
    /// Startet den Session-Task fuer `lokal`
    ///
    /// Das Bus-Abonnement besteht ab Rueckkehr dieser Funktion.
    pub fn starten(
        lokal: UserId,
        bus: Arc<dyn SignalingBus>,
        backend: Arc<dyn MediaBackend>,
        config: VoiceConfig,
    ) -> VoiceResult<Self> {
        config.validieren()?;

        let (befehl_tx, befehl_rx) = mpsc::channel(config.befehl_kapazitaet);
        let (zustand_tx, zustand_rx) = watch::channel(VoiceSessionState::default());
        let (ereignis_tx, ereignis_rx) = mpsc::unbounded_channel();
        let bus_rx = bus.abonnieren();
        let zuhoerer = Arc::new(Mutex::new(Zuhoerer::default()));

        let task = SessionTask {
            lokal,
            peers: PeerManager::neu(
                lokal,
                Arc::clone(&backend),
                Arc::clone(&bus),
                config.ice_server.clone(),
                ereignis_tx,
            ),
            monitor: AudioLevelMonitor::neu(config.fft_groesse, config.sprech_schwelle),
            presence: PresenceTracker::neu(),
            bus,
            backend,
            verhandlungs_timeout: config.verhandlungs_timeout(),
            status: VerbindungsStatus::Getrennt,
            aktiver_channel: None,
            lokaler_stream: None,
            stumm: false,
            taub: false,
            video: false,
            bildschirmfreigabe: false,
            zustand_tx,
            zuhoerer: Arc::clone(&zuhoerer),
        };
        tokio::spawn(task.ausfuehren(befehl_rx, bus_rx, ereignis_rx, config.monitor_intervall()));

        tracing::debug!(user_id = %lokal, "Voice-Session gestartet");

        Ok(Self {
            lokal,
            befehl_tx,
            zustand_rx,
            zuhoerer,
        })
    }

    pub fn lokale_id(&self) -> UserId {
        self.lokal
    }

    /// Tritt dem Voice-Channel bei
    ///
    /// Kehrt zurueck, wenn der Versuch abgeschlossen ist. Bei einem Fehler
    /// ist die Session wieder `Getrennt`.
    pub async fn channel_beitreten(&self, channel_id: ChannelId) -> VoiceResult<()> {
        self.anfragen(|antwort| Befehl::Beitreten {
            channel_id,
            antwort,
        })
        .await?
    }

    /// Reagiert auf die Channel-Auswahl; nur Voice-Channels loesen einen Join aus
    pub async fn channel_ausgewaehlt(&self, channel_id: ChannelId, typ: ChannelTyp) -> VoiceResult<()> {
        if !typ.ist_voice() {
            tracing::trace!(channel_id = %channel_id, "Text-Channel ausgewaehlt, kein Join");
            return Ok(());
        }
        self.channel_beitreten(channel_id).await
    }

    /// Verlaesst den aktiven Channel (ohne Wirkung wenn getrennt)
    pub async fn channel_verlassen(&self) -> VoiceResult<()> {
        self.anfragen(|antwort| Befehl::Verlassen { antwort }).await
    }

    /// Schaltet Mute um und gibt den neuen Zustand zurueck
    pub async fn stumm_umschalten(&self) -> VoiceResult<bool> {
        self.anfragen(|antwort| Befehl::StummUmschalten { antwort })
            .await
    }

    /// Schaltet Deafen um und gibt den neuen Zustand zurueck
    pub async fn taub_umschalten(&self) -> VoiceResult<bool> {
        self.anfragen(|antwort| Befehl::TaubUmschalten { antwort })
            .await
    }

    pub async fn video_umschalten(&self) -> VoiceResult<bool> {
        self.anfragen(|antwort| Befehl::VideoUmschalten { antwort })
            .await
    }

    pub async fn bildschirmfreigabe_umschalten(&self) -> VoiceResult<bool> {
        self.anfragen(|antwort| Befehl::BildschirmUmschalten { antwort })
            .await
    }

    /// Verlaesst den Channel und beendet den Session-Task
    pub async fn beenden(&self) -> VoiceResult<()> {
        self.anfragen(|antwort| Befehl::Beenden { antwort }).await
    }

    /// Aktuelle Momentaufnahme
    pub fn zustand(&self) -> VoiceSessionState {
        self.zustand_rx.borrow().clone()
    }

    /// Pull-Zugriff auf den Zustand (z.B. fuer `wait_for`)
    pub fn beobachten(&self) -> watch::Receiver<VoiceSessionState> {
        self.zustand_rx.clone()
    }

    /// Registriert einen Handler fuer Zustandsaenderungen
    ///
    /// Der Handler wird sofort mit dem aktuellen Zustand aufgerufen und
    /// danach bei jeder Aenderung im Session-Task. Der sofortige Aufruf
    /// haelt die Zuhoerer-Sperre und darf auf dieser Session weder abonnieren
    /// noch kuendigen; spaetere Aufrufe duerfen beides.
    pub fn abonnieren<F>(&self, handler: F) -> Abonnement
    where
        F: Fn(&VoiceSessionState) + Send + Sync + 'static,
    {
        let mut zuhoerer = self.zuhoerer.lock();
        handler(&self.zustand_rx.borrow());
        let id = zuhoerer.naechste_id;
        zuhoerer.naechste_id += 1;
        zuhoerer.handler.insert(id, Arc::new(handler));
        Abonnement {
            id,
            zuhoerer: Arc::downgrade(&self.zuhoerer),
        }
    }

    async fn anfragen<T>(
        &self,
        befehl: impl FnOnce(oneshot::Sender<T>) -> Befehl,
    ) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.befehl_tx
            .send(befehl(tx))
            .await
            .map_err(|_| VoiceError::SessionBeendet)?;
        rx.await.map_err(|_| VoiceError::SessionBeendet)
    }
}

// ---------------------------------------------------------------------------
// SessionTask
// ---------------------------------------------------------------------------

/// Besitzer des gesamten Session-Zustands
struct SessionTask {
    lokal: UserId,
    bus: Arc<dyn SignalingBus>,
    backend: Arc<dyn MediaBackend>,
    peers: PeerManager,
    monitor: AudioLevelMonitor,
    presence: PresenceTracker,
    verhandlungs_timeout: Option<Duration>,

    status: VerbindungsStatus,
    aktiver_channel: Option<ChannelId>,
    lokaler_stream: Option<Arc<dyn MediaStream>>,
    stumm: bool,
    taub: bool,
    video: bool,
    bildschirmfreigabe: bool,

    zustand_tx: watch::Sender<VoiceSessionState>,
    zuhoerer: Arc<Mutex<Zuhoerer>>,
}

impl SessionTask {
    async fn ausfuehren(
        mut self,
        mut befehl_rx: mpsc::Receiver<Befehl>,
        mut bus_rx: broadcast::Receiver<SignalNachricht>,
        mut ereignis_rx: mpsc::UnboundedReceiver<PeerEreignis>,
        intervall: Duration,
    ) {
        let mut takt = tokio::time::interval(intervall);
        takt.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bus_offen = true;

        loop {
            tokio::select! {
                befehl = befehl_rx.recv() => {
                    let Some(befehl) = befehl else {
                        // Alle Handles gedroppt
                        self.verlassen();
                        break;
                    };
                    if !self.befehl_ausfuehren(befehl).await {
                        break;
                    }
                }

                nachricht = bus_rx.recv(), if bus_offen => match nachricht {
                    Ok(nachricht) => self.signal_verarbeiten(nachricht).await,
                    Err(broadcast::error::RecvError::Lagged(verpasst)) => {
                        tracing::warn!(user_id = %self.lokal, verpasst, "Signaling-Nachrichten verpasst");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!(user_id = %self.lokal, "Signaling-Bus geschlossen");
                        bus_offen = false;
                    }
                },

                Some(ereignis) = ereignis_rx.recv() => self.peer_ereignis(ereignis),

                _ = takt.tick() => self.takt(),
            }
        }

        tracing::debug!(user_id = %self.lokal, "Voice-Session beendet");
    }

    /// Gibt `false` zurueck wenn der Task enden soll
    async fn befehl_ausfuehren(&mut self, befehl: Befehl) -> bool {
        match befehl {
            Befehl::Beitreten {
                channel_id,
                antwort,
            } => {
                let ergebnis = self.beitreten(channel_id).await;
                let _ = antwort.send(ergebnis);
            }
            Befehl::Verlassen { antwort } => {
                self.verlassen();
                let _ = antwort.send(());
            }
            Befehl::StummUmschalten { antwort } => {
                self.stumm = !self.stumm;
                if let Some(stream) = &self.lokaler_stream {
                    stream.spur_aktivieren(!self.stumm);
                }
                tracing::debug!(user_id = %self.lokal, stumm = self.stumm, "Mute umgeschaltet");
                self.benachrichtigen();
                let _ = antwort.send(self.stumm);
            }
            Befehl::TaubUmschalten { antwort } => {
                self.taub = !self.taub;
                self.peers.taub_setzen(self.taub);
                tracing::debug!(user_id = %self.lokal, taub = self.taub, "Deafen umgeschaltet");
                self.benachrichtigen();
                let _ = antwort.send(self.taub);
            }
            Befehl::VideoUmschalten { antwort } => {
                self.video = !self.video;
                self.benachrichtigen();
                let _ = antwort.send(self.video);
            }
            Befehl::BildschirmUmschalten { antwort } => {
                self.bildschirmfreigabe = !self.bildschirmfreigabe;
                self.benachrichtigen();
                let _ = antwort.send(self.bildschirmfreigabe);
            }
            Befehl::Beenden { antwort } => {
                self.verlassen();
                let _ = antwort.send(());
                return false;
            }
        }
        true
    }

    // -- Join / Leave ---------------------------------------------------------

    async fn beitreten(&mut self, channel_id: ChannelId) -> VoiceResult<()> {
        if self.aktiver_channel == Some(channel_id) {
            tracing::debug!(channel_id = %channel_id, "Bereits im Channel, Join ignoriert");
            return Ok(());
        }
        if self.aktiver_channel.is_some() {
            self.verlassen();
        }

        self.status = VerbindungsStatus::Verbindend;
        self.benachrichtigen();

        let stream = match self.backend.mikrofon_oeffnen().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(user_id = %self.lokal, channel_id = %channel_id, fehler = %e, "Join abgebrochen: kein Mikrofon");
                // Noch kein Join publiziert, also auch kein Leave
                self.abbauen();
                self.benachrichtigen();
                return Err(e);
            }
        };
        stream.spur_aktivieren(!self.stumm);

        self.aktiver_channel = Some(channel_id);
        self.lokaler_stream = Some(Arc::clone(&stream));
        self.presence.beitreten(channel_id, self.lokal);
        self.monitor.registrieren(PegelQuelle::Lokal, stream);
        self.bus.publizieren(SignalNachricht::Join {
            user_id: self.lokal,
            channel_id,
        });
        self.status = VerbindungsStatus::Verbunden;
        self.benachrichtigen();

        tracing::info!(user_id = %self.lokal, channel_id = %channel_id, "Voice-Channel beigetreten");
        Ok(())
    }

    fn verlassen(&mut self) {
        let Some(channel_id) = self.aktiver_channel else {
            return;
        };

        // Leave zuerst, damit die Gegenseite noch benachrichtigt wird
        self.bus.publizieren(SignalNachricht::Leave {
            user_id: self.lokal,
            channel_id,
        });
        self.presence.verlassen(channel_id, self.lokal);
        self.abbauen();
        self.benachrichtigen();

        tracing::info!(user_id = %self.lokal, channel_id = %channel_id, "Voice-Channel verlassen");
    }

    /// Gibt alle Medienressourcen frei und setzt den lokalen Zustand zurueck
    ///
    /// Sicher mehrfach aufrufbar.
    fn abbauen(&mut self) {
        if self.peers.anzahl() > 0 {
            tracing::debug!(user_id = %self.lokal, peers = self.peers.anzahl(), "Peers werden geschlossen");
        }
        self.peers.alle_schliessen();
        self.monitor.leeren();
        if let Some(stream) = self.lokaler_stream.take() {
            stream.stoppen();
        }
        self.aktiver_channel = None;
        self.stumm = false;
        self.taub = false;
        self.peers.taub_setzen(false);
        self.video = false;
        self.bildschirmfreigabe = false;
        self.status = VerbindungsStatus::Getrennt;
    }

    // -- Signaling ------------------------------------------------------------

    async fn signal_verarbeiten(&mut self, nachricht: SignalNachricht) {
        if nachricht.absender() == self.lokal {
            return;
        }
        self.presence.beobachten(&nachricht);

        let betrifft_uns = self.aktiver_channel == Some(nachricht.channel_id())
            && nachricht.ziel().map_or(true, |ziel| ziel == self.lokal);
        let stream = match (&self.lokaler_stream, betrifft_uns) {
            (Some(stream), true) => Arc::clone(stream),
            _ => {
                // Fremder Channel oder fremder Adressat: nur Presence
                self.benachrichtigen();
                return;
            }
        };

        let channel_id = nachricht.channel_id();
        tracing::trace!(user_id = %self.lokal, art = nachricht.art(), von = %nachricht.absender(), "Signal verarbeiten");

        match nachricht {
            SignalNachricht::Join { user_id, .. } => {
                self.peers.initiator_starten(user_id, channel_id, &stream).await;
            }
            SignalNachricht::Leave { user_id, .. } => {
                if self.peers.entfernen(user_id) {
                    tracing::info!(
                        remote = %user_id,
                        channel_id = %channel_id,
                        verbleibend = self.peers.anzahl(),
                        "Teilnehmer hat den Channel verlassen"
                    );
                }
            }
            SignalNachricht::Offer { user_id, offer, .. } => {
                self.peers
                    .angebot_beantworten(user_id, channel_id, offer, &stream)
                    .await;
            }
            SignalNachricht::Answer { user_id, answer, .. } => {
                self.peers.antwort_anwenden(user_id, answer).await;
            }
            SignalNachricht::IceCandidate {
                user_id, candidate, ..
            } => {
                self.peers.kandidat_hinzufuegen(user_id, candidate).await;
            }
        }

        self.entfernte_aufraeumen();
        self.benachrichtigen();
    }

    fn peer_ereignis(&mut self, ereignis: PeerEreignis) {
        if let Some((remote, stream)) = self.peers.ereignis_verarbeiten(ereignis, self.aktiver_channel) {
            self.monitor.registrieren(PegelQuelle::Remote(remote), stream);
        }
        self.entfernte_aufraeumen();
        self.benachrichtigen();
    }

    fn entfernte_aufraeumen(&mut self) {
        for remote in self.peers.entfernte_abholen() {
            self.monitor.entfernen(PegelQuelle::Remote(remote), self.lokal);
        }
    }

    // -- Monitor-Takt ---------------------------------------------------------

    fn takt(&mut self) {
        let mut geaendert = false;

        if let Some(frist) = self.verhandlungs_timeout {
            if self.peers.zeitueberschreitungen_pruefen(frist) > 0 {
                self.entfernte_aufraeumen();
                geaendert = true;
            }
        }
        geaendert |= self.monitor.abtasten(self.lokal, self.stumm);

        // Nur Ticks mit Aenderung benachrichtigen
        if geaendert {
            self.benachrichtigen();
        }
    }

    // -- Zustand --------------------------------------------------------------

    fn schnappschuss(&self) -> VoiceSessionState {
        let teilnehmer: BTreeSet<UserId> = if self.aktiver_channel.is_some() {
            std::iter::once(self.lokal)
                .chain(self.peers.teilnehmer())
                .collect()
        } else {
            BTreeSet::new()
        };

        VoiceSessionState {
            status: self.status,
            aktiver_channel: self.aktiver_channel,
            stumm: self.stumm,
            taub: self.taub,
            video: self.video,
            bildschirmfreigabe: self.bildschirmfreigabe,
            teilnehmer,
            channel_teilnehmer: self.presence.schnappschuss(),
            sprechende: self.monitor.sprecher().clone(),
        }
    }

    /// Verteilt den Zustand, falls er sich geaendert hat
    ///
    /// Die Handler laufen erst nach Freigabe der Zuhoerer-Sperre.
    fn benachrichtigen(&self) {
        let neu = self.schnappschuss();
        let handler: Vec<Handler> = {
            let zuhoerer = self.zuhoerer.lock();
            let geaendert = self.zustand_tx.send_if_modified(|aktuell| {
                if *aktuell == neu {
                    return false;
                }
                *aktuell = neu.clone();
                true
            });
            if !geaendert {
                return;
            }
            zuhoerer.handler.values().cloned().collect()
        };
        for h in &handler {
            h(&neu);
        }
    }
}
