//! Spektrumsanalyse – mittlere Energie eines Audiofensters
//!
//! Bildet die Byte-Spektrumsdarstellung eines Analyser-Knotens nach:
//! Blackman-Fenster, FFT, Betrag normiert auf die FFT-Groesse, Umrechnung
//! in dB und lineare Abbildung von [-100 dB, -30 dB] auf 0..=255. Der
//! Mittelwert ueber alle Bins ist das Mass fuer "spricht".

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Untere Grenze der dB-Abbildung
pub const MIN_DB: f32 = -100.0;
/// Obere Grenze der dB-Abbildung
pub const MAX_DB: f32 = -30.0;

/// FFT-basierter Pegelschaetzer mit fester Fenstergroesse
pub struct SpektrumAnalysator {
    fft: Arc<dyn Fft<f32>>,
    fenster: Vec<f32>,
    puffer: Vec<Complex<f32>>,
}

impl SpektrumAnalysator {
    /// Erstellt einen Analysator fuer `fft_groesse` Samples
    pub fn neu(fft_groesse: usize) -> Self {
        let groesse = fft_groesse.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(groesse);

        let fenster = (0..groesse)
            .map(|n| {
                let x = n as f32 / groesse as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft,
            fenster,
            puffer: vec![Complex::new(0.0, 0.0); groesse],
        }
    }

    /// FFT-Groesse in Samples
    pub fn fft_groesse(&self) -> usize {
        self.fenster.len()
    }

    /// Anzahl der Frequenz-Bins (halbe FFT-Groesse)
    pub fn bin_anzahl(&self) -> usize {
        self.fenster.len() / 2
    }

    /// Mittlere Byte-Energie (0..=255) ueber alle Bins
    ///
    /// Kuerzere Eingaben werden mit Stille aufgefuellt, bei laengeren zaehlt
    /// nur das juengste Fenster.
    pub fn mittlere_energie(&mut self, samples: &[f32]) -> f32 {
        let groesse = self.fenster.len();
        let start = samples.len().saturating_sub(groesse);
        let fenster_samples = &samples[start..];

        for (i, ziel) in self.puffer.iter_mut().enumerate() {
            let wert = fenster_samples.get(i).copied().unwrap_or(0.0);
            *ziel = Complex::new(wert * self.fenster[i], 0.0);
        }
        self.fft.process(&mut self.puffer);

        let bins = self.bin_anzahl();
        let summe: f32 = self.puffer[..bins]
            .iter()
            .map(|c| byte_wert(c.norm() / groesse as f32))
            .sum();
        summe / bins as f32
    }
}

/// Bildet einen normierten Betrag auf die Byte-Skala ab
fn byte_wert(betrag: f32) -> f32 {
    if betrag <= 0.0 || !betrag.is_finite() {
        return 0.0;
    }
    let db = 20.0 * betrag.log10();
    let skaliert = (db - MIN_DB) * 255.0 / (MAX_DB - MIN_DB);
    skaliert.clamp(0.0, 255.0).floor()
}
