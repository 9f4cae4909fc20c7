//! Fehlertypen fuer Palaver
//!
//! Zentraler Fehler-Enum der alle moeglichen Fehlerzustaende abdeckt.
//! Untermodule koennen eigene Fehler definieren und via `#[from]`
//! konvertieren. Fehler einzelner Requests brechen die Pipeline nie ab;
//! sie werden als Antwort-Variante zum Aufrufer transportiert.

use thiserror::Error;

/// Globaler Result-Alias fuer Palaver
pub type Result<T> = std::result::Result<T, PalaverError>;

/// Alle moeglichen Fehler im Palaver-System
#[derive(Debug, Error)]
pub enum PalaverError {
    // --- Netzwerk & Transport ---
    #[error("Transportfehler: {0}")]
    Transport(String),

    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    // --- HTTP ---
    #[error("HTTP-Fehler {status}: {koerper}")]
    Http { status: u16, koerper: String },

    // --- Dekodierung ---
    #[error("Antwort-Dekodierung fehlgeschlagen: {0}")]
    Dekodierung(#[from] serde_json::Error),

    // --- Protokoll ---
    #[error("Protokollverletzung: {0}")]
    Protokoll(String),

    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    // --- Request-Konstruktion ---
    #[error("Audit-Log-Begruendung zu lang: {0} Zeichen (Maximum 512)")]
    BegruendungZuLang(usize),

    // --- Pipeline ---
    #[error("Pipeline beendet: {0}")]
    PipelineBeendet(String),

    #[error("Wiederholungen erschoepft nach {versuche} Versuchen")]
    VersucheErschoepft { versuche: u32 },

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PalaverError {
    /// Erstellt einen Transportfehler aus einer beliebigen Quelle
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Erstellt eine Protokollverletzung aus einer beliebigen Nachricht
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    ///
    /// HTTP-Fehler gelten nur bei Server-Status (5xx) als wiederholbar.
    pub fn ist_wiederholbar(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Getrennt(_) | Self::Zeitlimit(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = PalaverError::Http {
            status: 404,
            koerper: "Unknown Channel".into(),
        };
        assert_eq!(e.to_string(), "HTTP-Fehler 404: Unknown Channel");
    }

    #[test]
    fn wiederholbar_erkennung() {
        assert!(PalaverError::Transport("abgebrochen".into()).ist_wiederholbar());
        assert!(PalaverError::Zeitlimit("gate".into()).ist_wiederholbar());
        assert!(PalaverError::Http {
            status: 502,
            koerper: String::new()
        }
        .ist_wiederholbar());
        assert!(!PalaverError::Http {
            status: 403,
            koerper: String::new()
        }
        .ist_wiederholbar());
        assert!(!PalaverError::BegruendungZuLang(600).ist_wiederholbar());
    }

    #[test]
    fn begruendung_fehler_nennt_laenge() {
        let e = PalaverError::BegruendungZuLang(513);
        assert!(e.to_string().contains("513"));
        assert!(e.to_string().contains("512"));
    }
}
