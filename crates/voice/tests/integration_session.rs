//! Integration-Tests fuer VoiceSession (LokalerBus + Simulationsnetz)
//!
//! Mehrere Sessions teilen einen Bus und ein SimMedienNetz, genau wie
//! mehrere Clients auf einem Rechner.

use kristal_core::types::{ChannelId, ChannelTyp, UserId};
use kristal_protocol::{IceKandidat, SignalNachricht};
use kristal_signaling::{LokalerBus, SignalingBus};
use kristal_voice::{
    Abonnement, SimMedienNetz, VerbindungsStatus, VoiceConfig, VoiceError, VoiceSession, VoiceSessionState,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WARTEZEIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Hilfsfunktionen
// ---------------------------------------------------------------------------

struct Umgebung {
    bus: Arc<LokalerBus>,
    netz: SimMedienNetz,
    config: VoiceConfig,
}

fn umgebung() -> Umgebung {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Umgebung {
        bus: Arc::new(LokalerBus::default()),
        netz: SimMedienNetz::neu(),
        config: VoiceConfig {
            monitor_intervall_ms: 20,
            ..VoiceConfig::default()
        },
    }
}

impl Umgebung {
    fn session(&self) -> VoiceSession {
        let lokal = UserId::new();
        VoiceSession::starten(
            lokal,
            self.bus.clone(),
            Arc::new(self.netz.backend(lokal)),
            self.config.clone(),
        )
        .expect("Session konnte nicht gestartet werden")
    }

    fn mithoeren(&self) -> broadcast::Receiver<SignalNachricht> {
        self.bus.abonnieren()
    }
}

fn ids(sessions: &[&VoiceSession]) -> BTreeSet<UserId> {
    sessions.iter().map(|s| s.lokale_id()).collect()
}

/// Wartet bis der Zustand von `session` die Bedingung erfuellt
async fn warten_bis<F>(session: &VoiceSession, bedingung: F) -> VoiceSessionState
where
    F: FnMut(&VoiceSessionState) -> bool,
{
    let mut rx = session.beobachten();
    tokio::time::timeout(WARTEZEIT, async move {
        rx.wait_for(bedingung).await.map(|z| z.clone())
    })
    .await
    .expect("Zustand nicht rechtzeitig erreicht")
    .expect("Session vorzeitig beendet")
}

async fn teilnehmer_warten(session: &VoiceSession, erwartet: BTreeSet<UserId>) {
    warten_bis(session, |z| z.teilnehmer == erwartet).await;
}

/// Pollt eine Bedingung ausserhalb der Session (z.B. im Simulationsnetz)
async fn eventuell(mut bedingung: impl FnMut() -> bool) {
    tokio::time::timeout(WARTEZEIT, async {
        while !bedingung() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Bedingung nicht rechtzeitig erfuellt");
}

fn nachrichten_von(rx: &mut broadcast::Receiver<SignalNachricht>, user: UserId) -> Vec<SignalNachricht> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|n| n.absender() == user)
        .collect()
}

// ---------------------------------------------------------------------------
// Join / Leave
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zwei_sessions_verhandeln_verbindung() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();

    a.channel_beitreten(kanal).await.unwrap();
    let zustand = a.zustand();
    assert_eq!(zustand.status, VerbindungsStatus::Verbunden);
    assert_eq!(zustand.aktiver_channel, Some(kanal));
    assert_eq!(zustand.teilnehmer, ids(&[&a]));

    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;
    teilnehmer_warten(&b, ids(&[&a, &b])).await;

    // Spuren und ICE-Kandidaten kommen auf beiden Seiten an
    let (ua, ub) = (a.lokale_id(), b.lokale_id());
    eventuell(|| umg.netz.offene_wiedergaben(ua) == 1 && umg.netz.offene_wiedergaben(ub) == 1).await;
    eventuell(|| {
        umg.netz.empfangene_kandidaten(ua, ub) > 0 && umg.netz.empfangene_kandidaten(ub, ua) > 0
    })
    .await;
    assert_eq!(umg.netz.offene_verbindungen(ua), 1);
    assert_eq!(umg.netz.offene_verbindungen(ub), 1);
}

#[tokio::test]
async fn leave_entfernt_peer_auf_gegenseite() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;

    b.channel_verlassen().await.unwrap();
    teilnehmer_warten(&a, ids(&[&a])).await;

    let (ua, ub) = (a.lokale_id(), b.lokale_id());
    eventuell(|| !umg.netz.hat_verbindung(ua, ub)).await;
    assert_eq!(umg.netz.offene_wiedergaben(ua), 0);
    assert_eq!(umg.netz.offene_verbindungen(ub), 0);

    let zustand_b = b.zustand();
    assert_eq!(zustand_b.status, VerbindungsStatus::Getrennt);
    assert!(zustand_b.aktiver_channel.is_none());
    assert!(zustand_b.teilnehmer.is_empty());
    assert!(umg.netz.mikrofon(ub).unwrap().ist_gestoppt());
}

#[tokio::test]
async fn doppelter_join_ist_idempotent() {
    let umg = umgebung();
    let mut mithoerer = umg.mithoeren();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();

    b.channel_beitreten(kanal).await.unwrap();
    a.channel_beitreten(kanal).await.unwrap();
    a.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&b, ids(&[&a, &b])).await;

    let joins = nachrichten_von(&mut mithoerer, a.lokale_id())
        .into_iter()
        .filter(|n| matches!(n, SignalNachricht::Join { .. }))
        .count();
    assert_eq!(joins, 1);
    assert_eq!(umg.netz.offene_verbindungen(a.lokale_id()), 1);
    assert_eq!(umg.netz.offene_verbindungen(b.lokale_id()), 1);
}

#[tokio::test]
async fn verlassen_ohne_channel_ist_noop() {
    let umg = umgebung();
    let mut mithoerer = umg.mithoeren();
    let a = umg.session();
    let vorher = a.zustand();

    a.channel_verlassen().await.unwrap();

    assert_eq!(a.zustand(), vorher);
    assert!(matches!(
        mithoerer.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn leave_setzt_schalter_zurueck() {
    let umg = umgebung();
    let a = umg.session();
    a.channel_beitreten(ChannelId::new()).await.unwrap();

    assert!(a.stumm_umschalten().await.unwrap());
    assert!(a.taub_umschalten().await.unwrap());
    assert!(a.video_umschalten().await.unwrap());
    assert!(a.bildschirmfreigabe_umschalten().await.unwrap());

    a.channel_verlassen().await.unwrap();
    let zustand = a.zustand();
    assert!(!zustand.stumm && !zustand.taub);
    assert!(!zustand.video && !zustand.bildschirmfreigabe);
}

#[tokio::test]
async fn mikrofonfehler_bricht_join_ohne_signaling_ab() {
    let umg = umgebung();
    let mut mithoerer = umg.mithoeren();
    let a = umg.session();
    umg.netz.mikrofon_fehler_setzen(a.lokale_id(), true);

    let verlauf = Arc::new(Mutex::new(Vec::new()));
    let v = Arc::clone(&verlauf);
    let _abo = a.abonnieren(move |z| v.lock().push(z.status));

    let ergebnis = a.channel_beitreten(ChannelId::new()).await;
    assert!(matches!(ergebnis, Err(VoiceError::MedienZugriff(_))));

    let zustand = a.zustand();
    assert_eq!(zustand.status, VerbindungsStatus::Getrennt);
    assert!(zustand.aktiver_channel.is_none());
    assert!(zustand.teilnehmer.is_empty());
    assert!(nachrichten_von(&mut mithoerer, a.lokale_id()).is_empty(), "Weder Join noch Leave");
    assert_eq!(
        *verlauf.lock(),
        vec![
            VerbindungsStatus::Getrennt,
            VerbindungsStatus::Verbindend,
            VerbindungsStatus::Getrennt
        ]
    );

    // Nach Behebung klappt der Join
    umg.netz.mikrofon_fehler_setzen(a.lokale_id(), false);
    a.channel_beitreten(ChannelId::new()).await.unwrap();
    assert!(a.zustand().ist_verbunden());
}

#[tokio::test]
async fn channelwechsel_verlaesst_alten_channel() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let c1 = ChannelId::new();
    let c2 = ChannelId::new();

    a.channel_beitreten(c1).await.unwrap();
    b.channel_beitreten(c1).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;

    let mut mithoerer = umg.mithoeren();
    a.channel_beitreten(c2).await.unwrap();

    let von_a: Vec<SignalNachricht> = nachrichten_von(&mut mithoerer, a.lokale_id())
        .into_iter()
        .filter(|n| n.ziel().is_none())
        .collect();
    assert_eq!(
        von_a,
        vec![
            SignalNachricht::Leave { user_id: a.lokale_id(), channel_id: c1 },
            SignalNachricht::Join { user_id: a.lokale_id(), channel_id: c2 },
        ]
    );

    teilnehmer_warten(&b, ids(&[&b])).await;
    let zustand_a = a.zustand();
    assert_eq!(zustand_a.aktiver_channel, Some(c2));
    assert_eq!(zustand_a.teilnehmer, ids(&[&a]));
    assert_eq!(umg.netz.offene_verbindungen(a.lokale_id()), 0);

    // Globale Presence kennt B weiterhin in c1
    assert!(zustand_a.channel_teilnehmer.ist_in(&c1, &b.lokale_id()));
    assert!(zustand_a.channel_teilnehmer.ist_in(&c2, &a.lokale_id()));
}

#[tokio::test]
async fn text_channel_loest_keinen_join_aus() {
    let umg = umgebung();
    let a = umg.session();

    a.channel_ausgewaehlt(ChannelId::new(), ChannelTyp::Text).await.unwrap();
    assert_eq!(a.zustand().status, VerbindungsStatus::Getrennt);

    let kanal = ChannelId::new();
    a.channel_ausgewaehlt(kanal, ChannelTyp::Voice).await.unwrap();
    assert_eq!(a.zustand().aktiver_channel, Some(kanal));
}

// ---------------------------------------------------------------------------
// Sprecher-Erkennung
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mute_unterdrueckt_eigene_sprecher_erkennung() {
    let umg = umgebung();
    let a = umg.session();
    let ua = a.lokale_id();
    umg.netz.pegel_setzen(ua, 0.5);

    a.channel_beitreten(ChannelId::new()).await.unwrap();
    warten_bis(&a, |z| z.spricht(&ua)).await;

    assert!(a.stumm_umschalten().await.unwrap());
    warten_bis(&a, |z| !z.spricht(&ua)).await;

    // Mikrofon hoert weiter, nur die Spur ist deaktiviert
    let mikrofon = umg.netz.mikrofon(ua).unwrap();
    assert!(!mikrofon.ist_aktiv());
    assert!(!mikrofon.ist_gestoppt());

    assert!(!a.stumm_umschalten().await.unwrap());
    let zurueck = tokio::time::timeout(Duration::from_millis(500), async {
        warten_bis(&a, |z| z.spricht(&ua)).await
    })
    .await;
    assert!(zurueck.is_ok(), "Sprecher nach Unmute nicht zeitnah erkannt");
}

#[tokio::test]
async fn remote_sprecher_und_remote_mute() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let ub = b.lokale_id();
    let kanal = ChannelId::new();
    umg.netz.pegel_setzen(ub, 0.5);

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();

    warten_bis(&a, |z| z.spricht(&ub)).await;

    // Deaktivierte Spur kommt als Stille an
    b.stumm_umschalten().await.unwrap();
    warten_bis(&a, |z| !z.spricht(&ub)).await;
}

#[tokio::test]
async fn stille_wird_nicht_als_sprechen_erkannt() {
    let umg = umgebung();
    let a = umg.session();
    a.channel_beitreten(ChannelId::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.zustand().sprechende.is_empty());
}

// ---------------------------------------------------------------------------
// Deafen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn taub_schaltet_alle_wiedergaben_stumm() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let c = umg.session();
    let kanal = ChannelId::new();
    let (ua, ub, uc) = (a.lokale_id(), b.lokale_id(), c.lokale_id());

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    eventuell(|| umg.netz.wiedergabe_stumm(ua, ub) == Some(false)).await;

    assert!(a.taub_umschalten().await.unwrap());
    assert_eq!(umg.netz.wiedergabe_stumm(ua, ub), Some(true));

    // Neue Wiedergaben uebernehmen den Deafen-Zustand
    c.channel_beitreten(kanal).await.unwrap();
    eventuell(|| umg.netz.wiedergabe_stumm(ua, uc) == Some(true)).await;

    assert!(!a.taub_umschalten().await.unwrap());
    assert_eq!(umg.netz.wiedergabe_stumm(ua, ub), Some(false));
    assert_eq!(umg.netz.wiedergabe_stumm(ua, uc), Some(false));
}

// ---------------------------------------------------------------------------
// Fehlerfaelle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ice_kandidat_fuer_unbekannten_peer_wird_verworfen() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let geist = UserId::new();
    let kanal = ChannelId::new();

    let verlauf = Arc::new(Mutex::new(Vec::<BTreeSet<UserId>>::new()));
    let v = Arc::clone(&verlauf);
    let _abo = a.abonnieren(move |z| v.lock().push(z.teilnehmer.clone()));

    a.channel_beitreten(kanal).await.unwrap();
    umg.bus.publizieren(SignalNachricht::IceCandidate {
        user_id: geist,
        target_id: a.lokale_id(),
        channel_id: kanal,
        candidate: IceKandidat::neu("candidate:verspaetet"),
    });

    // B tritt danach bei; sobald A ihn sieht, ist der Kandidat verarbeitet
    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;

    assert!(verlauf.lock().iter().all(|t| !t.contains(&geist)));
    assert!(a.zustand().ist_verbunden());
}

#[tokio::test]
async fn ice_kandidat_nach_leave_wird_verworfen() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let c = umg.session();
    let kanal = ChannelId::new();
    let ub = b.lokale_id();

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;

    b.channel_verlassen().await.unwrap();
    teilnehmer_warten(&a, ids(&[&a])).await;

    let verlauf = Arc::new(Mutex::new(Vec::<BTreeSet<UserId>>::new()));
    let v = Arc::clone(&verlauf);
    let _abo = a.abonnieren(move |z| v.lock().push(z.teilnehmer.clone()));

    // Verspaeteter Kandidat von B nach dessen Leave
    umg.bus.publizieren(SignalNachricht::IceCandidate {
        user_id: ub,
        target_id: a.lokale_id(),
        channel_id: kanal,
        candidate: IceKandidat::neu("candidate:nach-leave"),
    });

    // C tritt danach einem anderen Channel bei; sobald A das in der
    // Presence sieht, ist der Kandidat verarbeitet
    let anderer = ChannelId::new();
    let uc = c.lokale_id();
    c.channel_beitreten(anderer).await.unwrap();
    warten_bis(&a, |z| z.channel_teilnehmer.ist_in(&anderer, &uc)).await;

    assert!(verlauf.lock().iter().all(|t| !t.contains(&ub)));
    assert_eq!(a.zustand().teilnehmer, ids(&[&a]));
    assert_eq!(umg.netz.offene_verbindungen(a.lokale_id()), 0);
}

#[tokio::test]
async fn verhandlungsfehler_bleibt_isoliert() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let x = umg.session();
    let kanal = ChannelId::new();
    umg.netz.verhandlungsfehler_setzen(x.lokale_id(), true);

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    x.channel_beitreten(kanal).await.unwrap();

    let ux = x.lokale_id();
    let zustand_a = warten_bis(&a, |z| z.channel_teilnehmer.ist_in(&kanal, &ux)).await;
    assert_eq!(zustand_a.teilnehmer, ids(&[&a, &b]), "Fehlgeschlagener Peer nicht gelistet");
    teilnehmer_warten(&b, ids(&[&a, &b])).await;
    assert_eq!(x.zustand().teilnehmer, ids(&[&x]));
    assert!(x.zustand().ist_verbunden());
}

#[tokio::test]
async fn peer_ohne_spur_wird_nach_frist_entfernt() {
    let mut umg = umgebung();
    umg.config.verhandlungs_timeout_ms = 200;
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();
    umg.netz.spur_unterdruecken(b.lokale_id(), true);

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&a, ids(&[&a, &b])).await;

    teilnehmer_warten(&a, ids(&[&a])).await;
    teilnehmer_warten(&b, ids(&[&b])).await;
    assert_eq!(umg.netz.offene_verbindungen(a.lokale_id()), 0);
}

#[tokio::test]
async fn verbindungsabbruch_entfernt_peer() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    let (ua, ub) = (a.lokale_id(), b.lokale_id());
    eventuell(|| umg.netz.offene_wiedergaben(ua) == 1 && umg.netz.offene_wiedergaben(ub) == 1).await;

    assert_eq!(umg.netz.verbindungsabbruch(ub), 2);
    teilnehmer_warten(&a, ids(&[&a])).await;
    teilnehmer_warten(&b, ids(&[&b])).await;

    // Beide bleiben im Channel verbunden
    assert!(a.zustand().ist_verbunden());
    assert!(b.zustand().ist_verbunden());
}

// ---------------------------------------------------------------------------
// Konsistenz und Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn n_sessions_konvergieren() {
    let umg = umgebung();
    let sessions: Vec<VoiceSession> = (0..5).map(|_| umg.session()).collect();
    let kanal = ChannelId::new();

    // Gleichzeitige Joins provozieren gleichzeitige Offers
    let joins: Vec<_> = sessions
        .iter()
        .cloned()
        .map(|s| tokio::spawn(async move { s.channel_beitreten(kanal).await }))
        .collect();
    for join in joins {
        join.await.unwrap().unwrap();
    }

    let alle: BTreeSet<UserId> = sessions.iter().map(|s| s.lokale_id()).collect();
    for session in &sessions {
        teilnehmer_warten(session, alle.clone()).await;
    }
    for session in &sessions {
        let lokal = session.lokale_id();
        eventuell(|| umg.netz.offene_wiedergaben(lokal) == 4).await;
    }

    // Zwei verlassen gleichzeitig
    let (gehen, bleiben) = sessions.split_at(2);
    let leaves: Vec<_> = gehen
        .iter()
        .cloned()
        .map(|s| tokio::spawn(async move { s.channel_verlassen().await }))
        .collect();
    for leave in leaves {
        leave.await.unwrap().unwrap();
    }

    let rest: BTreeSet<UserId> = bleiben.iter().map(|s| s.lokale_id()).collect();
    for session in bleiben {
        teilnehmer_warten(session, rest.clone()).await;
        assert_eq!(umg.netz.offene_verbindungen(session.lokale_id()), rest.len() - 1);
    }
    for session in gehen {
        assert!(session.zustand().teilnehmer.is_empty());
    }
}

#[tokio::test]
async fn globale_presence_ist_beratend() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let c1 = ChannelId::new();
    let c2 = ChannelId::new();
    let ub = b.lokale_id();

    a.channel_beitreten(c1).await.unwrap();
    b.channel_beitreten(c2).await.unwrap();

    let zustand = warten_bis(&a, |z| z.channel_teilnehmer.ist_in(&c2, &ub)).await;
    assert_eq!(zustand.teilnehmer, ids(&[&a]), "Fremder Channel erzeugt keine Verbindung");
    assert!(zustand.channel_teilnehmer.ist_beratend());
    assert_eq!(umg.netz.offene_verbindungen(a.lokale_id()), 0);

    b.channel_verlassen().await.unwrap();
    warten_bis(&a, |z| z.channel_teilnehmer.mitglieder(&c2).is_empty()).await;
}

#[tokio::test]
async fn presence_auch_ohne_eigenen_channel() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();
    let ub = b.lokale_id();

    b.channel_beitreten(kanal).await.unwrap();
    let zustand = warten_bis(&a, |z| z.channel_teilnehmer.ist_in(&kanal, &ub)).await;
    assert_eq!(zustand.status, VerbindungsStatus::Getrennt);
    assert!(zustand.teilnehmer.is_empty());
}

// ---------------------------------------------------------------------------
// Abonnement und Lebenszyklus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abonnement_liefert_sofort_und_bei_aenderung() {
    let umg = umgebung();
    let a = umg.session();
    let verlauf = Arc::new(Mutex::new(Vec::<VoiceSessionState>::new()));
    let v = Arc::clone(&verlauf);

    let abo = a.abonnieren(move |z| v.lock().push(z.clone()));
    assert_eq!(verlauf.lock().len(), 1, "Sofortiger Aufruf mit aktuellem Zustand");

    a.channel_beitreten(ChannelId::new()).await.unwrap();
    let status: Vec<VerbindungsStatus> = verlauf.lock().iter().map(|z| z.status).collect();
    assert_eq!(
        status,
        vec![
            VerbindungsStatus::Getrennt,
            VerbindungsStatus::Verbindend,
            VerbindungsStatus::Verbunden
        ]
    );

    abo.kuendigen();
    let anzahl = verlauf.lock().len();
    a.stumm_umschalten().await.unwrap();
    assert_eq!(verlauf.lock().len(), anzahl, "Nach Kuendigung keine Aufrufe mehr");
}

#[tokio::test]
async fn handler_darf_waehrend_benachrichtigung_abonnieren() {
    let umg = umgebung();
    let a = umg.session();
    let innere = Arc::new(Mutex::new(Vec::<Abonnement>::new()));
    let gesehen = Arc::new(Mutex::new(Vec::<VerbindungsStatus>::new()));

    let (session, ablage, g) = (a.clone(), Arc::clone(&innere), Arc::clone(&gesehen));
    let abo = a.abonnieren(move |z| {
        if z.status != VerbindungsStatus::Verbunden || !ablage.lock().is_empty() {
            return;
        }
        let g = Arc::clone(&g);
        let inneres = session.abonnieren(move |z| g.lock().push(z.status));
        ablage.lock().push(inneres);
    });

    tokio::time::timeout(WARTEZEIT, a.channel_beitreten(ChannelId::new()))
        .await
        .expect("Session-Task blockiert im Handler")
        .unwrap();
    eventuell(|| !gesehen.lock().is_empty()).await;
    assert_eq!(gesehen.lock()[0], VerbindungsStatus::Verbunden);

    // Kuendigen aus dem Handler heraus blockiert ebenso wenig
    let ablage = Arc::clone(&innere);
    let kuendiger = a.abonnieren(move |z| {
        if z.stumm {
            ablage.lock().clear();
        }
    });
    tokio::time::timeout(WARTEZEIT, a.stumm_umschalten())
        .await
        .expect("Session-Task blockiert beim Kuendigen")
        .unwrap();
    assert!(innere.lock().is_empty());

    drop(kuendiger);
    drop(abo);
}

#[tokio::test]
async fn beenden_verlaesst_channel_und_stoppt_task() {
    let umg = umgebung();
    let a = umg.session();
    let b = umg.session();
    let kanal = ChannelId::new();

    a.channel_beitreten(kanal).await.unwrap();
    b.channel_beitreten(kanal).await.unwrap();
    teilnehmer_warten(&b, ids(&[&a, &b])).await;

    a.beenden().await.unwrap();
    teilnehmer_warten(&b, ids(&[&b])).await;

    assert!(matches!(
        a.channel_beitreten(kanal).await,
        Err(VoiceError::SessionBeendet)
    ));
}

#[tokio::test]
async fn ungueltige_config_verhindert_start() {
    let umg = umgebung();
    let config = VoiceConfig {
        fft_groesse: 100,
        ..VoiceConfig::default()
    };
    let lokal = UserId::new();
    let ergebnis = VoiceSession::starten(
        lokal,
        umg.bus.clone(),
        Arc::new(umg.netz.backend(lokal)),
        config,
    );
    assert!(matches!(ergebnis, Err(VoiceError::Konfiguration(_))));
}
