//! palaver-core – Gemeinsame Typen, Fehler und Konfiguration
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von den
//! REST- und Voice-Crates gemeinsam genutzt werden: ID-Typen, den
//! zentralen Fehler-Enum, die TOML-Konfiguration und das Logging-Setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use config::PalaverConfig;
pub use error::{PalaverError, Result};
pub use types::{ServerId, SessionId, UserId};
