//! Konfiguration der Voice-Session
//!
//! Alle Felder haben Standardwerte; eine leere TOML-Tabelle ergibt die
//! Standardkonfiguration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{VoiceError, VoiceResult};

/// Oeffentlicher STUN-Server als Standard fuer die ICE-Liste
pub const STANDARD_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Einstellungen einer Voice-Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Abtastintervall des Pegel-Monitors in Millisekunden
    pub monitor_intervall_ms: u64,
    /// Mittlere Spektrumsenergie (0..255), ab der eine Quelle spricht
    pub sprech_schwelle: f32,
    /// FFT-Groesse der Spektrumsanalyse (Zweierpotenz)
    pub fft_groesse: usize,
    /// Frist bis zum Eintreffen der Remote-Spur, 0 = keine Frist
    pub verhandlungs_timeout_ms: u64,
    /// ICE-Server fuer neue Peer-Verbindungen
    pub ice_server: Vec<String>,
    /// Kapazitaet des Signaling-Busses
    pub bus_kapazitaet: usize,
    /// Kapazitaet der Befehls-Queue einer Session
    pub befehl_kapazitaet: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            monitor_intervall_ms: 100,
            sprech_schwelle: 10.0,
            fft_groesse: 256,
            verhandlungs_timeout_ms: 15_000,
            ice_server: vec![STANDARD_STUN_SERVER.into()],
            bus_kapazitaet: 256,
            befehl_kapazitaet: 64,
        }
    }
}

impl VoiceConfig {
    /// Parst eine Konfiguration aus TOML und validiert sie
    pub fn aus_toml(inhalt: &str) -> VoiceResult<Self> {
        let config: Self =
            toml::from_str(inhalt).map_err(|e| VoiceError::Konfiguration(e.to_string()))?;
        config.validieren()?;
        Ok(config)
    }

    /// Laedt die Konfiguration aus einer TOML-Datei
    pub fn laden(pfad: &str) -> VoiceResult<Self> {
        let inhalt = std::fs::read_to_string(pfad)?;
        Self::aus_toml(&inhalt)
    }

    /// Prueft die Werte auf Plausibilitaet
    pub fn validieren(&self) -> VoiceResult<()> {
        if self.monitor_intervall_ms == 0 {
            return Err(VoiceError::Konfiguration(
                "monitor_intervall_ms muss groesser 0 sein".into(),
            ));
        }
        if self.fft_groesse < 32 || !self.fft_groesse.is_power_of_two() {
            return Err(VoiceError::Konfiguration(format!(
                "fft_groesse {} ist keine Zweierpotenz >= 32",
                self.fft_groesse
            )));
        }
        if !(0.0..=255.0).contains(&self.sprech_schwelle) {
            return Err(VoiceError::Konfiguration(format!(
                "sprech_schwelle {} liegt ausserhalb 0..=255",
                self.sprech_schwelle
            )));
        }
        if self.bus_kapazitaet == 0 || self.befehl_kapazitaet == 0 {
            return Err(VoiceError::Konfiguration(
                "Kapazitaeten muessen groesser 0 sein".into(),
            ));
        }
        Ok(())
    }

    /// Abtastintervall als Duration
    pub fn monitor_intervall(&self) -> Duration {
        Duration::from_millis(self.monitor_intervall_ms.max(1))
    }

    /// Verhandlungsfrist, `None` wenn abgeschaltet
    pub fn verhandlungs_timeout(&self) -> Option<Duration> {
        (self.verhandlungs_timeout_ms > 0).then(|| Duration::from_millis(self.verhandlungs_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardwerte() {
        let config = VoiceConfig::default();
        assert_eq!(config.monitor_intervall(), Duration::from_millis(100));
        assert_eq!(config.sprech_schwelle, 10.0);
        assert_eq!(config.fft_groesse, 256);
        assert_eq!(config.verhandlungs_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.ice_server, vec![STANDARD_STUN_SERVER.to_string()]);
        assert!(config.validieren().is_ok());
    }

    #[test]
    fn leeres_toml_ergibt_standard() {
        let config = VoiceConfig::aus_toml("").unwrap();
        assert_eq!(config, VoiceConfig::default());
    }

    #[test]
    fn toml_ueberschreibt_einzelne_felder() {
        let config = VoiceConfig::aus_toml(
            r#"
            monitor_intervall_ms = 50
            verhandlungs_timeout_ms = 0
            ice_server = ["stun:stun.example.org:3478"]
            "#,
        )
        .unwrap();
        assert_eq!(config.monitor_intervall_ms, 50);
        assert_eq!(config.verhandlungs_timeout(), None);
        assert_eq!(config.ice_server.len(), 1);
        assert_eq!(config.fft_groesse, 256);
    }

    #[test]
    fn ungueltige_fft_groesse_abgelehnt() {
        let ergebnis = VoiceConfig::aus_toml("fft_groesse = 100");
        assert!(matches!(ergebnis, Err(VoiceError::Konfiguration(_))));
    }

    #[test]
    fn kaputtes_toml_abgelehnt() {
        assert!(VoiceConfig::aus_toml("monitor_intervall_ms = \"schnell\"").is_err());
    }

    #[test]
    fn fehlende_datei_ist_io_fehler() {
        let ergebnis = VoiceConfig::laden("/nicht/vorhanden/voice.toml");
        assert!(matches!(ergebnis, Err(VoiceError::Io(_))));
    }
}
