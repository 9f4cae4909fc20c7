//! Palaver-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass die Bibliothek ohne Konfigurations-
//! datei lauffaehig ist.

use serde::{Deserialize, Serialize};

/// Vollstaendige Palaver-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalaverConfig {
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Protokollierung der Nutzlasten an den REST/WS-Grenzen
    pub protokolle: ProtokollEinstellungen,
    /// Form der Voice-Paket-Queue (vom UDP-Helfer konsumiert)
    pub voice: VoiceEinstellungen,
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Schalter fuer das Mitloggen von Nutzlasten an den Protokollgrenzen
///
/// Standardmaessig alles aus – Nutzlasten koennen Tokens und private
/// Inhalte enthalten.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtokollEinstellungen {
    /// Empfangene REST-Antwortkoerper loggen
    pub log_received_rest: bool,
    /// Gesendete REST-Anfragekoerper loggen
    pub log_sent_rest: bool,
    /// Empfangene WebSocket-Frames loggen
    pub log_received_ws: bool,
    /// Gesendete WebSocket-Frames loggen
    pub log_sent_ws: bool,
}

/// Form der Voice-Paket-Queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceEinstellungen {
    /// Maximale Anzahl gepufferter Pakete bevor neue verworfen werden
    pub max_packets_before_drop: usize,
    /// Maximale Paketanzahl pro Sende-Burst
    pub max_burst_amount: usize,
    /// Anzahl Pakete die pro Weckzyklus aus der Queue entnommen werden
    pub send_request_amount: usize,
}

impl Default for VoiceEinstellungen {
    fn default() -> Self {
        Self {
            max_packets_before_drop: 128,
            max_burst_amount: 10,
            send_request_amount: 20,
        }
    }
}

impl PalaverConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = PalaverConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "text");
        assert!(!cfg.protokolle.log_received_rest);
        assert!(!cfg.protokolle.log_sent_ws);
        assert_eq!(cfg.voice.max_packets_before_drop, 128);
        assert_eq!(cfg.voice.max_burst_amount, 10);
        assert_eq!(cfg.voice.send_request_amount, 20);
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [protokolle]
            log_sent_rest = true
            log_received_ws = true

            [voice]
            max_packets_before_drop = 64
        "#;
        let cfg: PalaverConfig = toml::from_str(toml).unwrap();
        assert!(cfg.protokolle.log_sent_rest);
        assert!(cfg.protokolle.log_received_ws);
        assert!(!cfg.protokolle.log_received_rest);
        assert_eq!(cfg.voice.max_packets_before_drop, 64);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.voice.max_burst_amount, 10);
        assert_eq!(cfg.logging.level, "info");
    }
}
