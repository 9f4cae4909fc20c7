//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable:
//! - `PV_LOG_LEVEL`: Log-Level (trace/debug/info/warn/error), Standard: info
//! - `PV_LOG_FORMAT`: Format (text/json), Standard: text
//!
//! Die Umgebungsvariablen haben Vorrang vor der TOML-Konfiguration.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingEinstellungen;

/// Initialisiert das Logging-System.
///
/// Liest `PV_LOG_LEVEL` und `PV_LOG_FORMAT` aus der Umgebung.
/// Faellt auf die uebergebenen Einstellungen zurueck falls nicht gesetzt.
pub fn logging_initialisieren(einstellungen: &LoggingEinstellungen) {
    let filter = EnvFilter::try_from_env("PV_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new(&einstellungen.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = std::env::var("PV_LOG_FORMAT").unwrap_or_else(|_| einstellungen.format.clone());

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Validiert ob ein Log-Level-String gueltig ist.
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Validiert ob ein Log-Format-String gueltig ist.
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}
