//! Ratelimit-Ledger – autoritative Buchfuehrung pro Raw-Route
//!
//! Die Bucket-Tabelle wird von zwei Seiten veraendert (ankommende
//! Requests und Antwort-Updates). Ein einzelner Task besitzt die
//! Tabelle exklusiv und konsumiert Kommandos aus einer mpsc-Mailbox;
//! Antworten gehen ueber per-Request oneshot-Kanaele zurueck. So gibt
//! es keine Mehrschreiber-Races und keine feingranularen Locks.
//!
//! ## Kommandos
//!
//! - `WantToPass`: darf dieser Request jetzt passieren? Das Ledger
//!   antwortet sofort, stellt den Warter in eine FIFO-Schlange bis der
//!   Bucket auffuellt, oder der Aufrufer gibt nach `max_wartezeit` auf
//!   (-> Dropped).
//! - `UpdateRatelimits`: Momentaufnahme aus einer Antwort einpflegen.
//!   Der Dienst ist die Quelle der Wahrheit; Werte ersetzen den
//!   optimistischen Abzug, sie werden nie addiert.
//!
//! Ein globales Tor (429 mit Global-Flag) sperrt alle Routen bis zu
//! seinem Ablauf.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Kapazitaet der Kommando-Mailbox
const MAILBOX_KAPAZITAET: usize = 64;

/// Das Ledger ist nicht mehr erreichbar – fatal fuer die Pipeline
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Ratelimit-Ledger beendet")]
pub struct LedgerBeendet;

/// Kommandos an den Ledger-Task
enum LedgerKommando {
    WantToPass {
        raw_route: String,
        antwort: oneshot::Sender<()>,
    },
    UpdateRatelimits {
        raw_route: String,
        is_global: bool,
        til_reset: Duration,
        remaining: i64,
        limit: i64,
    },
}

/// Ein wartender Request
struct Warter {
    antwort: oneshot::Sender<()>,
}

/// Buchungs-Eintrag pro Raw-Route
///
/// `None` bedeutet: der Dienst hat den Wert noch nie mitgeteilt.
#[derive(Default)]
struct Bucket {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    wartende: VecDeque<Warter>,
}

impl Bucket {
    /// Fuellt das Fenster auf wenn der Reset-Zeitpunkt erreicht ist
    fn ggf_auffuellen(&mut self, jetzt: Instant) {
        if let Some(reset) = self.reset_at {
            if jetzt >= reset {
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }
    }

    /// Ist sofortiger Durchlass moeglich? (ohne Ruecksicht auf Warter)
    fn kann_passieren(&self) -> bool {
        match self.remaining {
            None => true,
            Some(0) => false,
            Some(_) => true,
        }
    }

    /// Verbucht einen Durchlass (optimistischer Abzug)
    fn abbuchen(&mut self) {
        if let Some(n) = self.remaining {
            self.remaining = Some(n.saturating_sub(1));
        }
    }

    /// Laesst wartende Requests in FIFO-Reihenfolge durch, solange das
    /// Fenster Platz hat. Warter deren Aufrufer aufgegeben hat (Kanal
    /// geschlossen) verbrauchen keinen Platz.
    fn wartende_durchlassen(&mut self) {
        while self.kann_passieren() {
            let Some(warter) = self.wartende.pop_front() else {
                break;
            };
            if warter.antwort.send(()).is_ok() {
                self.abbuchen();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RatelimitLedger (Handle)
// ---------------------------------------------------------------------------

/// Handle auf den Ledger-Task
///
/// Clonebar und zwischen Pipelines teilbar; alle Klone sprechen mit
/// demselben Task und damit derselben Bucket-Tabelle.
#[derive(Clone)]
pub struct RatelimitLedger {
    tx: mpsc::Sender<LedgerKommando>,
}

impl RatelimitLedger {
    /// Startet den Ledger-Task und gibt das Handle zurueck
    pub fn starten() -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_KAPAZITAET);
        tokio::spawn(ledger_task(rx));
        Self { tx }
    }

    /// Fragt an ob ein Request der Raw-Route jetzt passieren darf
    ///
    /// Gibt `Ok(true)` bei Durchlass zurueck, `Ok(false)` wenn die
    /// maximale Wartezeit ablaeuft bevor der Bucket Platz hat.
    ///
    /// # Fehler
    /// `LedgerBeendet` wenn der Ledger-Task nicht mehr lebt; das ist
    /// fuer die Pipeline fatal.
    pub async fn will_passieren(
        &self,
        raw_route: &str,
        max_wartezeit: Duration,
    ) -> Result<bool, LedgerBeendet> {
        let (antwort_tx, antwort_rx) = oneshot::channel();
        self.tx
            .send(LedgerKommando::WantToPass {
                raw_route: raw_route.to_string(),
                antwort: antwort_tx,
            })
            .await
            .map_err(|_| LedgerBeendet)?;

        match tokio::time::timeout(max_wartezeit, antwort_rx).await {
            Ok(Ok(())) => Ok(true),
            // Task weg ohne zu antworten
            Ok(Err(_)) => Err(LedgerBeendet),
            // Wartezeit abgelaufen -> Dropped beim Aufrufer
            Err(_) => Ok(false),
        }
    }

    /// Pflegt eine Ratelimit-Momentaufnahme ein (Seiteneffekt, fire-and-forget)
    pub async fn ratelimits_aktualisieren(
        &self,
        raw_route: &str,
        is_global: bool,
        til_reset: Duration,
        remaining: i64,
        limit: i64,
    ) {
        let _ = self
            .tx
            .send(LedgerKommando::UpdateRatelimits {
                raw_route: raw_route.to_string(),
                is_global,
                til_reset,
                remaining,
                limit,
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Ledger-Task
// ---------------------------------------------------------------------------

/// Schlaeft bis zum Zeitpunkt; ohne Zeitpunkt fuer immer
async fn schlafen_bis(zeitpunkt: Option<Instant>) {
    match zeitpunkt {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

/// Der eigentliche Ledger-Task: Besitzer der Bucket-Tabelle
async fn ledger_task(mut rx: mpsc::Receiver<LedgerKommando>) {
    let mut buckets: HashMap<String, Bucket> = HashMap::new();
    let mut globales_tor: Option<Instant> = None;

    tracing::debug!("Ratelimit-Ledger gestartet");

    loop {
        let weckzeit = naechste_weckzeit(&buckets, globales_tor);

        tokio::select! {
            kommando = rx.recv() => {
                match kommando {
                    Some(k) => kommando_verarbeiten(k, &mut buckets, &mut globales_tor),
                    // Alle Handles weg -> Ledger faehrt herunter
                    None => break,
                }
            }
            _ = schlafen_bis(weckzeit) => {
                faellige_abarbeiten(&mut buckets, &mut globales_tor);
            }
        }
    }

    tracing::debug!("Ratelimit-Ledger beendet");
}

/// Fruehester Zeitpunkt zu dem etwas zu tun ist
///
/// Geweckt wird nur wenn Warter existieren: Buckets ohne Warter werden
/// beim naechsten `WantToPass` lazy aufgefuellt.
fn naechste_weckzeit(buckets: &HashMap<String, Bucket>, globales_tor: Option<Instant>) -> Option<Instant> {
    let gibt_warter = buckets.values().any(|b| !b.wartende.is_empty());
    if !gibt_warter {
        return None;
    }

    if let Some(tor) = globales_tor {
        return Some(tor);
    }

    buckets
        .values()
        .filter(|b| !b.wartende.is_empty())
        .filter_map(|b| b.reset_at)
        .min()
}

/// Verarbeitet ein einzelnes Kommando
fn kommando_verarbeiten(
    kommando: LedgerKommando,
    buckets: &mut HashMap<String, Bucket>,
    globales_tor: &mut Option<Instant>,
) {
    let jetzt = Instant::now();

    match kommando {
        LedgerKommando::WantToPass { raw_route, antwort } => {
            // Abgelaufenes globales Tor aufraeumen
            if matches!(*globales_tor, Some(t) if jetzt >= t) {
                *globales_tor = None;
            }

            let bucket = buckets.entry(raw_route.clone()).or_default();
            bucket.ggf_auffuellen(jetzt);

            let tor_aktiv = globales_tor.is_some();

            // FIFO: solange Warter existieren reiht sich jeder Neuankoemmling
            // hinten ein, auch wenn das Fenster gerade Platz haette.
            if tor_aktiv || !bucket.wartende.is_empty() || !bucket.kann_passieren() {
                tracing::trace!(raw_route = %raw_route, "Request eingereiht");
                bucket.wartende.push_back(Warter { antwort });
            } else {
                bucket.abbuchen();
                // Aufrufer kann direkt nach dem Senden aufgegeben haben
                let _ = antwort.send(());
            }
        }

        LedgerKommando::UpdateRatelimits {
            raw_route,
            is_global,
            til_reset,
            remaining,
            limit,
        } => {
            tracing::trace!(
                raw_route = %raw_route,
                is_global,
                til_reset_ms = til_reset.as_millis() as u64,
                remaining,
                limit,
                "Ratelimit-Update"
            );

            if is_global && til_reset > Duration::ZERO {
                *globales_tor = Some(jetzt + til_reset);
            }

            let bucket = buckets.entry(raw_route).or_default();
            if limit >= 0 {
                bucket.limit = Some(limit as u32);
            }
            if remaining >= 0 {
                // Autoritativer Wert ersetzt den optimistischen Abzug
                bucket.remaining = Some(remaining as u32);
            }
            if til_reset > Duration::ZERO {
                bucket.reset_at = Some(jetzt + til_reset);
            }

            // Ein Update kann Platz freigegeben haben
            if globales_tor.is_none() {
                bucket.wartende_durchlassen();
            }
        }
    }
}

/// Laesst nach Ablauf von Toren und Fenstern faellige Warter durch
fn faellige_abarbeiten(buckets: &mut HashMap<String, Bucket>, globales_tor: &mut Option<Instant>) {
    let jetzt = Instant::now();

    if matches!(*globales_tor, Some(t) if jetzt >= t) {
        tracing::debug!("Globales Ratelimit-Tor abgelaufen");
        *globales_tor = None;
    }
    if globales_tor.is_some() {
        return;
    }

    for bucket in buckets.values_mut() {
        bucket.ggf_auffuellen(jetzt);
        bucket.wartende_durchlassen();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
