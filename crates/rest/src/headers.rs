//! Ratelimit-Header der Dienst-Antworten
//!
//! Der Dienst teilt den Zustand des getroffenen Buckets in jedem
//! Antwort-Header mit. `Retry-After` (Millisekunden) hat Vorrang vor
//! `X-RateLimit-Reset` (Epoch-Millisekunden). Fehlende Zahlenwerte
//! werden als -1 gefuehrt.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;

/// Fenster-Limit des Buckets
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Verbleibende Requests im Fenster
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Fenster-Reset als Epoch-Millisekunden
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Wartezeit in Millisekunden (Vorrang vor `X-RateLimit-Reset`)
pub const HEADER_RETRY_AFTER: &str = "Retry-After";
/// Prozessweites Limit?
pub const HEADER_GLOBAL: &str = "X-Ratelimit-Global";
/// Ausgehender Header fuer die Audit-Log-Begruendung
pub const HEADER_AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";

/// Momentaufnahme der Ratelimit-Header einer Antwort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatelimitSchnappschuss {
    /// Prozessweites Limit (nur bei 429 relevant)
    pub is_global: bool,
    /// Zeit bis zum Fenster-Reset (ZERO wenn nicht mitgeteilt)
    pub til_reset: Duration,
    /// Verbleibende Requests (-1 wenn nicht mitgeteilt)
    pub remaining: i64,
    /// Fenster-Limit (-1 wenn nicht mitgeteilt)
    pub limit: i64,
}

impl RatelimitSchnappschuss {
    /// Traegt die Momentaufnahme genug Information fuer ein Ledger-Update?
    pub fn ist_aussagekraeftig(&self) -> bool {
        self.til_reset > Duration::ZERO && self.remaining != -1 && self.limit != -1
    }
}

/// Liest einen Header als i64, -1 wenn fehlend oder unlesbar
fn ganzzahl(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|w| w.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

/// Aktuelle Zeit als Epoch-Millisekunden
pub fn jetzt_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Extrahiert die Ratelimit-Momentaufnahme aus den Antwort-Headern
pub fn schnappschuss_aus_headern(headers: &HeaderMap) -> RatelimitSchnappschuss {
    let retry_after = ganzzahl(headers, HEADER_RETRY_AFTER);
    let til_reset = if retry_after >= 0 {
        Duration::from_millis(retry_after as u64)
    } else {
        let reset_epoch = ganzzahl(headers, HEADER_RESET);
        if reset_epoch >= 0 {
            let delta = reset_epoch - jetzt_epoch_millis();
            Duration::from_millis(delta.max(0) as u64)
        } else {
            Duration::ZERO
        }
    };

    let is_global = headers
        .get(HEADER_GLOBAL)
        .and_then(|w| w.to_str().ok())
        .map(|s| s.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    RatelimitSchnappschuss {
        is_global,
        til_reset,
        remaining: ganzzahl(headers, HEADER_REMAINING),
        limit: ganzzahl(headers, HEADER_LIMIT),
    }
}
