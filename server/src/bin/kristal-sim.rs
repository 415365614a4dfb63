//! kristal-sim – Simulierte Voice-Sessions
//!
//! Startet mehrere Voice-Sessions mit dem Simulations-Backend in einem
//! Channel, laesst sie eine Weile laufen und berichtet, ob alle Sessions
//! dieselbe Teilnehmerliste sehen. Ohne `--relay` teilen sich die Sessions
//! einen prozessinternen Bus, mit `--relay` bekommt jede Session eine eigene
//! TCP-Verbindung zum Relay.
//!
//! Das Simulationsnetz lebt im Prozess: Spuren kommen nur zwischen Sessions
//! desselben Prozesses an. Mit `--backend webrtc` verhandeln die Sessions
//! echte WebRTC-Verbindungen, standardmaessig ohne Audio-Geraete.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use kristal_core::types::{ChannelId, UserId};
use kristal_observability::logging_initialisieren;
use kristal_signaling::{LokalerBus, RelayBus, SignalingBus};
use kristal_voice::media::MediaBackend;
use kristal_voice::{Abonnement, SimMedienNetz, VoiceConfig, VoiceSession, WebRtcBackend};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Pegel sprechender Sessions
const SPRECH_PEGEL: f32 = 0.4;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArt {
    /// Prozessinternes Simulationsnetz
    Sim,
    /// webrtc-rs Peer-Verbindungen
    Webrtc,
}

#[derive(Parser)]
#[command(name = "kristal-sim", about = "Simulierte Voice-Sessions gegen lokalen Bus oder Relay")]
struct Args {
    /// Anzahl der Sessions
    #[arg(short = 'n', long, default_value_t = 3)]
    sessions: usize,

    /// Relay-Adresse; ohne Angabe wird ein lokaler Bus verwendet
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// Voice-Channel (UUID); Standard ist ein zufaelliger Channel
    #[arg(long)]
    channel: Option<ChannelId>,

    /// Medien-Backend der Sessions
    #[arg(long, value_enum, default_value = "sim")]
    backend: BackendArt,

    /// Mikrofon und Lautsprecher verwenden (nur `--backend webrtc`)
    #[arg(long)]
    geraete: bool,

    /// Wie viele Sessions ein hoerbares Signal senden
    #[arg(long, default_value_t = 1)]
    sprecher: usize,

    /// Laufzeit in Sekunden
    #[arg(long, default_value_t = 5)]
    dauer: u64,

    /// VoiceConfig als TOML-Datei
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging_initialisieren(&args.log_level, &args.log_format);

    let voice_config = match &args.config {
        Some(pfad) => VoiceConfig::laden(pfad)?,
        None => VoiceConfig::default(),
    };
    let channel_id = args.channel.unwrap_or_default();
    let netz = SimMedienNetz::neu();
    let lokaler_bus = Arc::new(LokalerBus::neu(voice_config.bus_kapazitaet));

    tracing::info!(
        sessions = args.sessions,
        channel_id = %channel_id,
        relay = ?args.relay,
        webrtc = args.backend == BackendArt::Webrtc,
        "Simulation startet"
    );

    let mut sessions = Vec::with_capacity(args.sessions);
    let mut abonnements: Vec<Abonnement> = Vec::with_capacity(args.sessions);
    for index in 0..args.sessions {
        let bus: Arc<dyn SignalingBus> = match args.relay {
            Some(addr) => Arc::new(RelayBus::verbinden(addr, voice_config.bus_kapazitaet).await?),
            None => lokaler_bus.clone(),
        };
        let lokal = UserId::new();
        if index < args.sprecher {
            netz.pegel_setzen(lokal, SPRECH_PEGEL);
        }

        let backend: Arc<dyn MediaBackend> = match args.backend {
            BackendArt::Sim => Arc::new(netz.backend(lokal)),
            BackendArt::Webrtc if args.geraete => Arc::new(WebRtcBackend::neu()),
            BackendArt::Webrtc => Arc::new(WebRtcBackend::ohne_geraete()),
        };
        let session = VoiceSession::starten(lokal, bus, backend, voice_config.clone())?;
        abonnements.push(session.abonnieren(move |zustand| {
            tracing::debug!(
                user_id = %lokal,
                status = ?zustand.status,
                teilnehmer = zustand.teilnehmer.len(),
                sprechende = zustand.sprechende.len(),
                "Zustand geaendert"
            );
        }));
        sessions.push(session);
    }

    let joins: Vec<_> = sessions
        .iter()
        .cloned()
        .map(|s| tokio::spawn(async move { s.channel_beitreten(channel_id).await }))
        .collect();
    for join in joins {
        join.await??;
    }

    tokio::time::sleep(Duration::from_secs(args.dauer)).await;

    let alle: BTreeSet<UserId> = sessions.iter().map(|s| s.lokale_id()).collect();
    let mut konvergiert = true;
    for session in &sessions {
        let zustand = session.zustand();
        let vollstaendig = zustand.teilnehmer == alle;
        konvergiert &= vollstaendig;
        tracing::info!(
            user_id = %session.lokale_id(),
            teilnehmer = zustand.teilnehmer.len(),
            sprechende = zustand.sprechende.len(),
            offene_wiedergaben = netz.offene_wiedergaben(session.lokale_id()),
            vollstaendig,
            "Bericht"
        );
    }

    drop(abonnements);
    for session in &sessions {
        session.channel_verlassen().await?;
        session.beenden().await?;
    }

    if !konvergiert {
        bail!("Teilnehmerlisten nicht konvergiert");
    }
    tracing::info!(sessions = sessions.len(), "Alle Sessions konvergiert");
    Ok(())
}
