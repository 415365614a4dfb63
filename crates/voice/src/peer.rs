//! Peer-Manager – Eine Medienverbindung pro Remote-Teilnehmer
//!
//! Treibt den Offer/Answer/ICE-Austausch. Die Schluessel von `peers` sind
//! genau die Remote-Teilnehmer der Session: wer keine Verbindung mehr hat,
//! ist kein Teilnehmer mehr. Schlaegt eine Verhandlung fehl, wird der Peer
//! sofort entfernt statt als Karteileiche stehen zu bleiben.
//!
//! ## Ablauf
//! ```text
//! join von R      -> Initiator: Offer erstellen, lokal setzen, Offer an R
//! offer von R     -> Responder: Remote setzen, Answer erstellen, lokal setzen, Answer an R
//! answer von R    -> Remote setzen (unbekannt: verwerfen)
//! ice von R       -> Kandidat hinzufuegen (unbekannt: verwerfen)
//! leave von R     -> Verbindung schliessen, Wiedergabe entfernen
//! ```
//!
//! Gleichzeitige Offers (beide Seiten haben den Join der anderen gesehen)
//! loest die kleinere UserId auf: ihr eigenes Offer bleibt, das fremde wird
//! ignoriert. Die groessere Seite verwirft ihr Offer und antwortet.

use kristal_core::types::{ChannelId, UserId};
use kristal_protocol::{BeschreibungsTyp, IceKandidat, SignalNachricht, SitzungsBeschreibung};
use kristal_signaling::SignalingBus;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::{VoiceError, VoiceResult};
use crate::media::{
    MediaBackend, MediaStream, PeerEreignis, PeerEreignisArt, PeerEreignisSender, PeerVerbindung,
    Rolle, VerbindungsAnfrage, Wiedergabe,
};

// ---------------------------------------------------------------------------
// PeerEintrag
// ---------------------------------------------------------------------------

struct PeerEintrag {
    verbindung: Box<dyn PeerVerbindung>,
    rolle: Rolle,
    generation: u64,
    erstellt: Instant,
    /// Remote-Beschreibung gesetzt (Initiator: Answer angewendet)
    beschreibung_gesetzt: bool,
    wiedergabe: Option<Box<dyn Wiedergabe>>,
}

impl PeerEintrag {
    fn spur_eingetroffen(&self) -> bool {
        self.wiedergabe.is_some()
    }

    fn abbauen(&mut self) {
        self.verbindung.schliessen();
        if let Some(mut wiedergabe) = self.wiedergabe.take() {
            wiedergabe.entfernen();
        }
    }
}

// ---------------------------------------------------------------------------
// PeerManager
// ---------------------------------------------------------------------------

/// Verwaltet alle Peer-Verbindungen einer Session im aktiven Channel
///
/// Gehoert exklusiv dem Session-Task.
pub struct PeerManager {
    lokal: UserId,
    backend: Arc<dyn MediaBackend>,
    bus: Arc<dyn SignalingBus>,
    ice_server: Vec<String>,
    ereignis_tx: mpsc::UnboundedSender<PeerEreignis>,
    peers: BTreeMap<UserId, PeerEintrag>,
    naechste_generation: u64,
    taub: bool,
    /// Seit dem letzten Abholen entfernte Peers (fuer den Pegel-Monitor)
    entfernt: Vec<UserId>,
}

impl PeerManager {
    pub fn neu(
        lokal: UserId,
        backend: Arc<dyn MediaBackend>,
        bus: Arc<dyn SignalingBus>,
        ice_server: Vec<String>,
        ereignis_tx: mpsc::UnboundedSender<PeerEreignis>,
    ) -> Self {
        Self {
            lokal,
            backend,
            bus,
            ice_server,
            ereignis_tx,
            peers: BTreeMap::new(),
            naechste_generation: 0,
            taub: false,
            entfernt: Vec::new(),
        }
    }

    /// Remote-Teilnehmer mit Verbindung (aufgebaut oder im Aufbau)
    pub fn teilnehmer(&self) -> impl Iterator<Item = UserId> + '_ {
        self.peers.keys().copied()
    }

    pub(crate) fn anzahl(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn hat_peer(&self, remote: &UserId) -> bool {
        self.peers.contains_key(remote)
    }

    /// Seit dem letzten Aufruf entfernte Peers
    pub fn entfernte_abholen(&mut self) -> Vec<UserId> {
        std::mem::take(&mut self.entfernt)
    }

    // -- Signaling ------------------------------------------------------------

    /// Join von `remote` im aktiven Channel: Verbindung als Initiator aufbauen
    pub async fn initiator_starten(
        &mut self,
        remote: UserId,
        channel_id: ChannelId,
        lokaler_stream: &Arc<dyn MediaStream>,
    ) {
        if self.entfernen(remote) {
            tracing::debug!(remote = %remote, "Erneuter Join: bestehende Verbindung ersetzt");
        }

        let generation = self.generation_vergeben();
        let mut verbindung = match self.verbindung_oeffnen(remote, Rolle::Initiator, generation).await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(remote = %remote, fehler = %e, "Peer-Verbindung nicht erstellt");
                return;
            }
        };
        verbindung.spuren_anhaengen(Arc::clone(lokaler_stream));

        match angebot_aushandeln(verbindung.as_mut()).await {
            Ok(offer) => {
                self.bus.publizieren(SignalNachricht::Offer {
                    user_id: self.lokal,
                    target_id: remote,
                    channel_id,
                    offer,
                });
                self.peers.insert(
                    remote,
                    PeerEintrag {
                        verbindung,
                        rolle: Rolle::Initiator,
                        generation,
                        erstellt: Instant::now(),
                        beschreibung_gesetzt: false,
                        wiedergabe: None,
                    },
                );
                tracing::info!(remote = %remote, channel_id = %channel_id, "Offer gesendet");
            }
            Err(e) => {
                verbindung.schliessen();
                self.entfernt.push(remote);
                tracing::warn!(remote = %remote, fehler = %e, "Offer fehlgeschlagen, Peer verworfen");
            }
        }
    }

    /// Offer von `remote`: Verbindung als Responder aufbauen und antworten
    pub async fn angebot_beantworten(
        &mut self,
        remote: UserId,
        channel_id: ChannelId,
        offer: SitzungsBeschreibung,
        lokaler_stream: &Arc<dyn MediaStream>,
    ) {
        if offer.typ != BeschreibungsTyp::Offer {
            tracing::warn!(remote = %remote, typ = ?offer.typ, "Offer-Nachricht ohne Offer verworfen");
            return;
        }

        if let Some(bestehend) = self.peers.get(&remote) {
            let eigenes_offer_offen =
                bestehend.rolle == Rolle::Initiator && !bestehend.beschreibung_gesetzt;
            if eigenes_offer_offen && self.lokal < remote {
                tracing::debug!(remote = %remote, "Gleichzeitige Offers: eigenes Offer hat Vorrang");
                return;
            }
            self.entfernen(remote);
            tracing::debug!(remote = %remote, "Bestehende Verbindung durch Responder ersetzt");
        }

        let generation = self.generation_vergeben();
        let mut verbindung = match self.verbindung_oeffnen(remote, Rolle::Responder, generation).await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(remote = %remote, fehler = %e, "Peer-Verbindung nicht erstellt");
                return;
            }
        };
        verbindung.spuren_anhaengen(Arc::clone(lokaler_stream));

        match antwort_aushandeln(verbindung.as_mut(), offer).await {
            Ok(answer) => {
                self.bus.publizieren(SignalNachricht::Answer {
                    user_id: self.lokal,
                    target_id: remote,
                    channel_id,
                    answer,
                });
                self.peers.insert(
                    remote,
                    PeerEintrag {
                        verbindung,
                        rolle: Rolle::Responder,
                        generation,
                        erstellt: Instant::now(),
                        beschreibung_gesetzt: true,
                        wiedergabe: None,
                    },
                );
                tracing::info!(remote = %remote, channel_id = %channel_id, "Answer gesendet");
            }
            Err(e) => {
                verbindung.schliessen();
                self.entfernt.push(remote);
                tracing::warn!(remote = %remote, fehler = %e, "Answer fehlgeschlagen, Peer verworfen");
            }
        }
    }

    /// Answer von `remote` auf das eigene Offer anwenden
    pub async fn antwort_anwenden(&mut self, remote: UserId, answer: SitzungsBeschreibung) {
        let Some(eintrag) = self.peers.get_mut(&remote) else {
            tracing::debug!(remote = %remote, "Answer ohne Verbindung verworfen");
            return;
        };
        if eintrag.rolle != Rolle::Initiator || eintrag.beschreibung_gesetzt {
            tracing::debug!(remote = %remote, rolle = ?eintrag.rolle, "Unerwartete Answer verworfen");
            return;
        }

        match eintrag.verbindung.remote_beschreibung_setzen(answer).await {
            Ok(()) => {
                eintrag.beschreibung_gesetzt = true;
                tracing::debug!(remote = %remote, "Answer angewendet");
            }
            Err(e) => {
                tracing::warn!(remote = %remote, fehler = %e, "Answer nicht anwendbar, Peer verworfen");
                self.entfernen(remote);
            }
        }
    }

    /// ICE-Kandidat von `remote` hinzufuegen
    pub async fn kandidat_hinzufuegen(&mut self, remote: UserId, kandidat: IceKandidat) {
        let Some(eintrag) = self.peers.get_mut(&remote) else {
            tracing::debug!(remote = %remote, "ICE-Kandidat ohne Verbindung verworfen");
            return;
        };
        if let Err(e) = eintrag.verbindung.ice_kandidat_hinzufuegen(kandidat).await {
            tracing::debug!(remote = %remote, fehler = %e, "ICE-Kandidat nicht hinzugefuegt");
        }
    }

    // -- Verbindungsereignisse ---------------------------------------------------

    /// Verarbeitet eine Rueckmeldung des Medien-Stacks
    ///
    /// Gibt eine neu eingetroffene Remote-Spur zurueck, die der Pegel-Monitor
    /// uebernehmen soll.
    pub fn ereignis_verarbeiten(
        &mut self,
        ereignis: PeerEreignis,
        channel_id: Option<ChannelId>,
    ) -> Option<(UserId, Arc<dyn MediaStream>)> {
        let remote = ereignis.remote;
        let aktuell = self
            .peers
            .get(&remote)
            .is_some_and(|e| e.generation == ereignis.generation);
        if !aktuell {
            tracing::trace!(
                remote = %remote,
                generation = ereignis.generation,
                art = ereignis.art.name(),
                "Ereignis einer ersetzten Verbindung verworfen"
            );
            return None;
        }

        match ereignis.art {
            PeerEreignisArt::IceKandidatGefunden(candidate) => {
                if let Some(channel_id) = channel_id {
                    self.bus.publizieren(SignalNachricht::IceCandidate {
                        user_id: self.lokal,
                        target_id: remote,
                        channel_id,
                        candidate,
                    });
                }
                None
            }
            PeerEreignisArt::SpurEingetroffen(stream) => {
                let wiedergabe =
                    self.backend
                        .wiedergabe_erstellen(remote, Arc::clone(&stream), self.taub);
                let eintrag = self.peers.get_mut(&remote)?;
                if let Some(mut alt) = eintrag.wiedergabe.replace(wiedergabe) {
                    alt.entfernen();
                }
                tracing::info!(remote = %remote, taub = self.taub, "Remote-Spur eingetroffen");
                Some((remote, stream))
            }
            PeerEreignisArt::VerbindungFehlgeschlagen(grund) => {
                tracing::warn!(remote = %remote, grund = %grund, "Peer-Verbindung fehlgeschlagen, Peer verworfen");
                self.entfernen(remote);
                None
            }
        }
    }

    /// Verwirft Peers, deren Spur nicht innerhalb von `frist` eingetroffen ist
    pub fn zeitueberschreitungen_pruefen(&mut self, frist: Duration) -> usize {
        let abgelaufen: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, e)| !e.spur_eingetroffen() && e.erstellt.elapsed() > frist)
            .map(|(id, _)| *id)
            .collect();

        for remote in &abgelaufen {
            tracing::warn!(remote = %remote, frist_ms = frist.as_millis() as u64, "Verhandlung nicht abgeschlossen, Peer verworfen");
            self.entfernen(*remote);
        }
        abgelaufen.len()
    }

    // -- Lebenszyklus ---------------------------------------------------------

    /// Schliesst die Verbindung zu `remote`
    ///
    /// Gibt `true` zurueck wenn eine Verbindung bestand.
    pub fn entfernen(&mut self, remote: UserId) -> bool {
        match self.peers.remove(&remote) {
            Some(mut eintrag) => {
                eintrag.abbauen();
                self.entfernt.push(remote);
                tracing::debug!(remote = %remote, "Peer-Verbindung geschlossen");
                true
            }
            None => false,
        }
    }

    /// Schliesst alle Verbindungen (Leave, Channel-Wechsel, Fehlerbehandlung)
    pub fn alle_schliessen(&mut self) {
        let anzahl = self.peers.len();
        for (_, mut eintrag) in std::mem::take(&mut self.peers) {
            eintrag.abbauen();
        }
        self.entfernt.clear();
        if anzahl > 0 {
            tracing::debug!(anzahl, "Alle Peer-Verbindungen geschlossen");
        }
    }

    /// Setzt den Deafen-Zustand fuer bestehende und kuenftige Wiedergaben
    pub fn taub_setzen(&mut self, taub: bool) {
        self.taub = taub;
        for eintrag in self.peers.values_mut() {
            if let Some(wiedergabe) = eintrag.wiedergabe.as_mut() {
                wiedergabe.stumm_setzen(taub);
            }
        }
    }

    // -- intern ---------------------------------------------------------------

    fn generation_vergeben(&mut self) -> u64 {
        self.naechste_generation += 1;
        self.naechste_generation
    }

    async fn verbindung_oeffnen(
        &mut self,
        remote: UserId,
        rolle: Rolle,
        generation: u64,
    ) -> VoiceResult<Box<dyn PeerVerbindung>> {
        let anfrage = VerbindungsAnfrage {
            lokal: self.lokal,
            remote,
            rolle,
            ice_server: self.ice_server.clone(),
            ereignisse: PeerEreignisSender::neu(remote, generation, self.ereignis_tx.clone()),
        };
        self.backend.verbindung_erstellen(anfrage).await
    }
}

async fn angebot_aushandeln(verbindung: &mut dyn PeerVerbindung) -> VoiceResult<SitzungsBeschreibung> {
    let offer = verbindung.angebot_erstellen().await?;
    verbindung.lokale_beschreibung_setzen(offer.clone()).await?;
    Ok(offer)
}

async fn antwort_aushandeln(
    verbindung: &mut dyn PeerVerbindung,
    offer: SitzungsBeschreibung,
) -> VoiceResult<SitzungsBeschreibung> {
    verbindung.remote_beschreibung_setzen(offer).await?;
    let answer = verbindung.antwort_erstellen().await?;
    if answer.typ != BeschreibungsTyp::Answer {
        return Err(VoiceError::UngueltigeBeschreibung(format!(
            "Answer erwartet, {:?} erhalten",
            answer.typ
        )));
    }
    verbindung.lokale_beschreibung_setzen(answer.clone()).await?;
    Ok(answer)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
