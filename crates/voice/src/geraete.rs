//! Audio-Geraete via cpal und Opus via audiopus
//!
//! cpal-Streams sind nicht `Send` und leben deshalb in je einem eigenen
//! Thread. Zwischen cpal-Callback und Thread liegt ein lock-freier
//! Ring-Buffer, zwischen Thread und Session eine [`PcmQuelle`].
//!
//! ```text
//! Mikrofon -> cpal-Callback -> Ring-Buffer -> kristal-mikrofon  -> PcmQuelle::einspeisen
//! PcmQuelle-Frames -> kristal-wiedergabe -> Ring-Buffer -> cpal-Callback -> Lautsprecher
//! ```

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, Stream, StreamConfig};
use kristal_core::types::UserId;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use crate::error::{VoiceError, VoiceResult};
use crate::rtc::{PcmQuelle, WiedergabeSteuerung, ABTASTRATE, FRAME_SAMPLES};

/// Ring-Buffer-Kapazitaet in Samples (2 Sekunden)
const RING_KAPAZITAET: usize = ABTASTRATE as usize * 2;

/// Wartezeit der Geraete-Threads, wenn keine Daten anliegen
const ABFRAGE_INTERVALL: Duration = Duration::from_millis(5);

/// Maximale Opus-Paketgroesse
const MAX_PAKET: usize = 4000;

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: ABTASTRATE,
        buffer_size: BufferSize::Default,
    }
}

// ---------------------------------------------------------------------------
// Aufnahme
// ---------------------------------------------------------------------------

/// Startet die Aufnahme des Standard-Mikrofons in `quelle`
///
/// Kehrt zurueck sobald der Stream laeuft oder das Oeffnen gescheitert ist.
/// Der Thread endet mit `quelle.stoppen()`.
pub(crate) async fn aufnahme_starten(quelle: Arc<PcmQuelle>) -> VoiceResult<()> {
    let (bereit_tx, bereit_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("kristal-mikrofon".to_string())
        .spawn(move || aufnahme_thread(quelle, bereit_tx))?;

    bereit_rx
        .await
        .map_err(|_| VoiceError::MedienZugriff("Aufnahme-Thread vorzeitig beendet".into()))?
}

fn aufnahme_thread(quelle: Arc<PcmQuelle>, bereit: oneshot::Sender<VoiceResult<()>>) {
    let (_stream, mut konsument) = match eingabe_oeffnen() {
        Ok(offen) => {
            let _ = bereit.send(Ok(()));
            offen
        }
        Err(e) => {
            let _ = bereit.send(Err(e));
            return;
        }
    };

    let mut frame = Vec::with_capacity(FRAME_SAMPLES);
    let mut puffer = vec![0.0f32; FRAME_SAMPLES];
    while !quelle.ist_gestoppt() {
        let gelesen = konsument.pop_slice(&mut puffer);
        if gelesen == 0 {
            std::thread::sleep(ABFRAGE_INTERVALL);
            continue;
        }
        for sample in &puffer[..gelesen] {
            frame.push(*sample);
            if frame.len() == FRAME_SAMPLES {
                quelle.einspeisen(&frame);
                frame.clear();
            }
        }
    }
    tracing::debug!("Aufnahme beendet");
}

fn eingabe_oeffnen() -> VoiceResult<(Stream, HeapCons<f32>)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::MedienZugriff("Kein Eingabegeraet gefunden".into()))?;
    let format = sample_format(&device, true)?;

    let (mut produzent, konsument) = HeapRb::<f32>::new(RING_KAPAZITAET).split();
    let fehler = |e: cpal::StreamError| tracing::error!(fehler = %e, "Capture-Fehler");
    let config = stream_config();

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let geschrieben = produzent.push_slice(data);
                if geschrieben < data.len() {
                    tracing::warn!(verworfen = data.len() - geschrieben, "Capture Ring-Buffer voll");
                }
            },
            fehler,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                if produzent.push_slice(&floats) < floats.len() {
                    tracing::warn!("Capture Ring-Buffer voll");
                }
            },
            fehler,
            None,
        ),
        andere => {
            return Err(VoiceError::MedienZugriff(format!(
                "Nicht unterstuetztes Sample-Format: {andere:?}"
            )))
        }
    }
    .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?;
    tracing::debug!(abtastrate = ABTASTRATE, "Capture-Stream geoeffnet");
    Ok((stream, konsument))
}

// ---------------------------------------------------------------------------
// Wiedergabe
// ---------------------------------------------------------------------------

/// Spielt die Frames einer Remote-Spur auf dem Standard-Ausgabegeraet ab
///
/// Ohne Ausgabegeraet bleibt die Wiedergabe stumm; der Fehler wird nur
/// geloggt, weil eine fehlende Ausgabe die Verbindung nicht gefaehrdet.
pub(crate) fn wiedergabe_starten(
    remote: UserId,
    frames: broadcast::Receiver<Arc<[f32]>>,
    steuerung: Arc<WiedergabeSteuerung>,
) {
    let gestartet = std::thread::Builder::new()
        .name("kristal-wiedergabe".to_string())
        .spawn(move || wiedergabe_thread(remote, frames, steuerung));
    if let Err(e) = gestartet {
        tracing::warn!(remote = %remote, fehler = %e, "Wiedergabe-Thread nicht gestartet");
    }
}

fn wiedergabe_thread(
    remote: UserId,
    mut frames: broadcast::Receiver<Arc<[f32]>>,
    steuerung: Arc<WiedergabeSteuerung>,
) {
    let (_stream, mut produzent) = match ausgabe_oeffnen(Arc::clone(&steuerung)) {
        Ok(offen) => offen,
        Err(e) => {
            tracing::warn!(remote = %remote, fehler = %e, "Keine Wiedergabe moeglich");
            return;
        }
    };

    while !steuerung.ist_beendet() {
        match frames.try_recv() {
            Ok(frame) => {
                produzent.push_slice(&frame);
            }
            Err(broadcast::error::TryRecvError::Empty) => std::thread::sleep(ABFRAGE_INTERVALL),
            Err(broadcast::error::TryRecvError::Lagged(verpasst)) => {
                tracing::trace!(remote = %remote, verpasst, "Wiedergabe hinkt hinterher");
            }
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    tracing::debug!(remote = %remote, "Wiedergabe beendet");
}

fn ausgabe_oeffnen(steuerung: Arc<WiedergabeSteuerung>) -> VoiceResult<(Stream, HeapProd<f32>)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| VoiceError::MedienZugriff("Kein Ausgabegeraet gefunden".into()))?;
    let format = sample_format(&device, false)?;

    let (produzent, mut konsument) = HeapRb::<f32>::new(RING_KAPAZITAET).split();
    let fehler = |e: cpal::StreamError| tracing::error!(fehler = %e, "Playback-Fehler");
    let config = stream_config();

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let gelesen = konsument.pop_slice(data);
                // Stille fuer fehlende Samples und bei Deafen
                data[gelesen..].fill(0.0);
                if steuerung.ist_stumm() {
                    data.fill(0.0);
                }
            },
            fehler,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                let mut floats = vec![0.0f32; data.len()];
                konsument.pop_slice(&mut floats);
                let stumm = steuerung.ist_stumm();
                for (aus, s) in data.iter_mut().zip(floats.iter()) {
                    *aus = if stumm {
                        0
                    } else {
                        (*s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
                    };
                }
            },
            fehler,
            None,
        ),
        andere => {
            return Err(VoiceError::MedienZugriff(format!(
                "Nicht unterstuetztes Sample-Format: {andere:?}"
            )))
        }
    }
    .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?;
    tracing::debug!(abtastrate = ABTASTRATE, "Playback-Stream geoeffnet");
    Ok((stream, produzent))
}

/// Sample-Format einer passenden Geraete-Konfiguration, sonst F32
fn sample_format(device: &Device, eingabe: bool) -> VoiceResult<SampleFormat> {
    let passt = |min: u32, max: u32| min <= ABTASTRATE && max >= ABTASTRATE;
    let format = if eingabe {
        device
            .supported_input_configs()
            .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?
            .find(|c| passt(c.min_sample_rate(), c.max_sample_rate()))
            .map(|c| c.sample_format())
    } else {
        device
            .supported_output_configs()
            .map_err(|e| VoiceError::MedienZugriff(e.to_string()))?
            .find(|c| passt(c.min_sample_rate(), c.max_sample_rate()))
            .map(|c| c.sample_format())
    };
    Ok(format.unwrap_or(SampleFormat::F32))
}

// ---------------------------------------------------------------------------
// Opus
// ---------------------------------------------------------------------------

/// Opus-Encoder fuer 20-ms-Mono-Frames
pub(crate) struct OpusKodierer {
    encoder: Encoder,
}

impl OpusKodierer {
    pub(crate) fn neu() -> VoiceResult<Self> {
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;
        Ok(Self { encoder })
    }

    /// Kodiert genau einen Frame von [`FRAME_SAMPLES`] Samples
    pub(crate) fn kodieren(&mut self, pcm: &[f32]) -> VoiceResult<Vec<u8>> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(VoiceError::Codec(format!(
                "PCM-Frame muss {FRAME_SAMPLES} Samples lang sein, war {}",
                pcm.len()
            )));
        }
        let mut paket = vec![0u8; MAX_PAKET];
        let geschrieben = self
            .encoder
            .encode_float(pcm, &mut paket)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;
        paket.truncate(geschrieben);
        Ok(paket)
    }
}

/// Opus-Decoder fuer Mono-Ausgabe
pub(crate) struct OpusDekodierer {
    decoder: Decoder,
}

impl OpusDekodierer {
    pub(crate) fn neu() -> VoiceResult<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;
        Ok(Self { decoder })
    }

    pub(crate) fn dekodieren(&mut self, paket: &[u8]) -> VoiceResult<Vec<f32>> {
        // Opus-Pakete sind hoechstens 120 ms lang
        let mut pcm = vec![0.0f32; FRAME_SAMPLES * 6];
        let dekodiert = self
            .decoder
            .decode_float(Some(paket), &mut pcm, false)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;
        pcm.truncate(dekodiert);
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaStream;

    #[test]
    fn opus_kodiert_und_dekodiert_einen_frame() {
        let mut kodierer = OpusKodierer::neu().unwrap();
        let mut dekodierer = OpusDekodierer::neu().unwrap();

        let ton: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / ABTASTRATE as f32).sin() * 0.5)
            .collect();
        let paket = kodierer.kodieren(&ton).unwrap();
        assert!(!paket.is_empty() && paket.len() < MAX_PAKET);

        let pcm = dekodierer.dekodieren(&paket).unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }

    #[test]
    fn falsche_framegroesse_wird_abgelehnt() {
        let mut kodierer = OpusKodierer::neu().unwrap();
        assert!(matches!(
            kodierer.kodieren(&[0.0; 100]),
            Err(VoiceError::Codec(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Benoetigt Audio-Hardware"]
    async fn mikrofon_liefert_frames() {
        let quelle = Arc::new(PcmQuelle::neu());
        let mut frames = quelle.pcm_abonnieren().unwrap();
        aufnahme_starten(Arc::clone(&quelle)).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("Kein Frame vom Mikrofon")
            .unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        quelle.stoppen();
    }
}
