//! Request-Pipeline – vom typisierten Request zur strukturierten Antwort
//!
//! Die Pipeline verwandelt einen Strom von `Request<D, C>` in einen
//! Strom von `RequestAnswer<D, C>`. Stufen:
//!
//! ```text
//! Ingress (BegrenzterPuffer, Ueberlauf-Strategie)
//!     |            Vorzugskanal (Wiederholungen) --+
//!     v                                            |
//! Pumpe: select! { biased; Vorzug, Puffer } <------+
//!     |  bis zu `parallelitaet` Requests gleichzeitig (Semaphore)
//!     v
//! Ledger-Tor -> HTTP-Dispatch -> Antwort-Parse -> Egress
//!                                    |
//!                                    +--> UpdateRatelimits (Seitenkanal)
//! ```
//!
//! Die Reihenfolge der Antworten ist nicht garantiert; alle Stufen
//! arbeiten mit ungeordneter Fertigstellung. Der Vorzugskanal wird vor
//! dem Puffer abgefragt, damit Wiederholungen nie hinter frischem
//! Eingang verhungern.

use std::sync::Arc;
use std::time::Duration;

use palaver_core::config::ProtokollEinstellungen;
use palaver_core::{PalaverError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{mpsc, Semaphore};

use crate::answer::RequestAnswer;
use crate::buffer::{BegrenzterPuffer, PufferFehler, UeberlaufStrategie};
use crate::headers::{schnappschuss_aus_headern, HEADER_AUDIT_LOG_REASON};
use crate::ledger::RatelimitLedger;
use crate::request::Request;

/// Produkt-URL fuer den User-Agent
pub const PRODUKT_URL: &str = "https://github.com/palaver-chat/palaver";

/// Obergrenze fuer mitgelesene Fehler-Antwortkoerper
const MAX_FEHLER_KOERPER: usize = 4096;

/// Baut den User-Agent im vom Dienst geforderten Format
pub fn user_agent() -> String {
    format!("DiscordBot ({}, {})", PRODUKT_URL, env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Parameter der Request-Pipeline
#[derive(Debug, Clone)]
pub struct PipelineKonfig {
    /// Bearer-artige Zugangsdaten, unveraendert in den
    /// Authorization-Header durchgereicht
    pub zugangsdaten: String,
    /// Kapazitaet des Ingress-Puffers
    pub puffer_groesse: usize,
    /// Verhalten bei vollem Ingress-Puffer
    pub ueberlauf_strategie: UeberlaufStrategie,
    /// Maximale Wartezeit am Ledger-Tor bevor ein Request als
    /// `Dropped` beantwortet wird
    pub max_wartezeit: Duration,
    /// Anzahl gleichzeitig verarbeiteter Requests
    pub parallelitaet: usize,
    /// Schalter fuer das Mitloggen der Nutzlasten
    pub protokolle: ProtokollEinstellungen,
}

impl PipelineKonfig {
    /// Konfiguration mit Standardwerten
    pub fn neu(zugangsdaten: impl Into<String>) -> Self {
        Self {
            zugangsdaten: zugangsdaten.into(),
            puffer_groesse: 64,
            ueberlauf_strategie: UeberlaufStrategie::Backpressure,
            max_wartezeit: Duration::from_secs(60),
            parallelitaet: 4,
            protokolle: ProtokollEinstellungen::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineZugang
// ---------------------------------------------------------------------------

/// Eingangs-Handle der Pipeline
///
/// Clonebar; `schliessen` beendet die Pipeline sobald alle bereits
/// eingereihten Requests beantwortet sind.
pub struct PipelineZugang<D, C> {
    pub(crate) puffer: BegrenzterPuffer<Request<D, C>>,
}

impl<D, C> Clone for PipelineZugang<D, C> {
    fn clone(&self) -> Self {
        Self {
            puffer: self.puffer.clone(),
        }
    }
}

impl<D, C> PipelineZugang<D, C> {
    /// Reiht einen Request ein (Ueberlauf-Strategie des Puffers gilt)
    pub async fn senden(&self, anfrage: Request<D, C>) -> std::result::Result<(), PufferFehler> {
        self.puffer.einreihen(anfrage).await
    }

    /// Schliesst den Eingang
    pub fn schliessen(&self) {
        self.puffer.schliessen();
    }
}

// ---------------------------------------------------------------------------
// RequestPipeline
// ---------------------------------------------------------------------------

/// Fabrik fuer Request-Fluesse mit geteiltem HTTP-Connection-Pool
///
/// Eine `RequestPipeline` kann beliebig viele Fluesse starten; alle
/// teilen sich den reqwest-Client und (falls vorhanden) das Ledger.
pub struct RequestPipeline {
    client: reqwest::Client,
    konfig: Arc<PipelineKonfig>,
    ledger: Option<RatelimitLedger>,
}

impl RequestPipeline {
    /// Erstellt die Pipeline; ohne Ledger werden Rate-Limits ignoriert
    pub fn neu(konfig: PipelineKonfig, ledger: Option<RatelimitLedger>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent())
            .build()
            .map_err(|e| PalaverError::Konfiguration(format!("HTTP-Client: {e}")))?;

        Ok(Self {
            client,
            konfig: Arc::new(konfig),
            ledger,
        })
    }

    /// Zugriff auf die Konfiguration
    pub fn konfig(&self) -> &PipelineKonfig {
        &self.konfig
    }

    /// Startet einen Fluss: Zugang hinein, Antworten heraus
    pub fn starten<D, C>(
        &self,
    ) -> (
        PipelineZugang<D, C>,
        mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
    )
    where
        D: Send + 'static,
        C: Send + 'static,
    {
        let (vorzug_tx, zugang, egress) = self.starten_mit_vorzugskanal();
        // Ohne Wiederholungen bleibt der Vorzugskanal ungenutzt
        drop(vorzug_tx);
        (zugang, egress)
    }

    /// Startet einen Fluss mit Vorzugskanal fuer Wiederholungen
    ///
    /// Die Pumpe fragt den Vorzugskanal vor dem Ingress-Puffer ab
    /// (biased select). Der Kanal ist unbegrenzt: sein Inhalt ist durch
    /// die Zahl laufender Requests beschraenkt, und ein blockierender
    /// Rueckkanal vom Egress zum Ingress koennte sonst verklemmen.
    pub fn starten_mit_vorzugskanal<D, C>(
        &self,
    ) -> (
        mpsc::UnboundedSender<Request<D, C>>,
        PipelineZugang<D, C>,
        mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
    )
    where
        D: Send + 'static,
        C: Send + 'static,
    {
        let puffer = BegrenzterPuffer::neu(
            self.konfig.puffer_groesse,
            self.konfig.ueberlauf_strategie,
        );
        let (vorzug_tx, vorzug_rx) = mpsc::unbounded_channel();
        // Egress unbegrenzt: zu jedem Zeitpunkt liegen hoechstens
        // puffer_groesse + parallelitaet Antworten an, so blockieren
        // die Arbeiter nie und die Pumpe kann den Puffer immer leeren.
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();

        tokio::spawn(pumpe(
            puffer.clone(),
            vorzug_rx,
            self.client.clone(),
            Arc::clone(&self.konfig),
            self.ledger.clone(),
            egress_tx,
        ));

        (vorzug_tx, PipelineZugang { puffer }, egress_rx)
    }
}

// ---------------------------------------------------------------------------
// Pumpe und Request-Verarbeitung
// ---------------------------------------------------------------------------

/// Zentrale Pumpe: entnimmt Requests (Vorzug vor Puffer) und spawnt
/// pro Request einen Verarbeitungs-Task, begrenzt durch die Semaphore
async fn pumpe<D, C>(
    puffer: BegrenzterPuffer<Request<D, C>>,
    mut vorzug_rx: mpsc::UnboundedReceiver<Request<D, C>>,
    client: reqwest::Client,
    konfig: Arc<PipelineKonfig>,
    ledger: Option<RatelimitLedger>,
    egress_tx: mpsc::UnboundedSender<RequestAnswer<D, C>>,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(konfig.parallelitaet.max(1)));
    let mut puffer_offen = true;
    let mut vorzug_offen = true;

    while puffer_offen || vorzug_offen {
        let anfrage = tokio::select! {
            biased;
            wiederholung = vorzug_rx.recv(), if vorzug_offen => {
                match wiederholung {
                    Some(r) => r,
                    None => {
                        vorzug_offen = false;
                        continue;
                    }
                }
            }
            anfrage = puffer.entnehmen(), if puffer_offen => {
                match anfrage {
                    Some(r) => r,
                    None => {
                        puffer_offen = false;
                        continue;
                    }
                }
            }
        };

        // Abbruch: der Aufrufer hat den Egress fallen gelassen
        if egress_tx.is_closed() {
            break;
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let client = client.clone();
        let konfig = Arc::clone(&konfig);
        let ledger = ledger.clone();
        let egress_tx = egress_tx.clone();
        let puffer = puffer.clone();
        tokio::spawn(async move {
            anfrage_verarbeiten(anfrage, client, konfig, ledger, egress_tx, puffer).await;
            drop(permit);
        });
    }

    // Produzenten freigeben, falls die Pumpe wegen Abbruch endet
    puffer.schliessen();
}

/// Fuehrt einen einzelnen Request durch Tor, Dispatch und Parse
async fn anfrage_verarbeiten<D, C>(
    anfrage: Request<D, C>,
    client: reqwest::Client,
    konfig: Arc<PipelineKonfig>,
    ledger: Option<RatelimitLedger>,
    egress: mpsc::UnboundedSender<RequestAnswer<D, C>>,
    puffer: BegrenzterPuffer<Request<D, C>>,
) {
    let log_koerper = if konfig.protokolle.log_sent_rest {
        anfrage.koerper_fuer_log()
    } else {
        None
    };
    let Request {
        route,
        koerper,
        zusatz_header,
        begruendung,
        ctx,
        parser,
        ..
    } = anfrage;
    let raw_route = route.raw_route.clone();

    // 1. Ledger-Tor
    if let Some(ledger) = &ledger {
        match ledger.will_passieren(&raw_route, konfig.max_wartezeit).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(route = %route, "Request am Ledger-Tor verworfen");
                let _ = egress.send(RequestAnswer::Dropped { route, ctx });
                return;
            }
            Err(_) => {
                // Ledger-Tod ist katastrophal: Pipeline stilllegen
                tracing::error!(
                    route = %route,
                    "Ratelimit-Ledger nicht erreichbar, Pipeline wird angehalten"
                );
                puffer.schliessen();
                return;
            }
        }
    }

    // 2. HTTP-Nachricht bauen
    let mut http = client
        .request(route.methode.als_http(), &route.uri)
        .header(AUTHORIZATION, konfig.zugangsdaten.as_str());
    if let Some(grund) = &begruendung {
        http = http.header(HEADER_AUDIT_LOG_REASON, grund.as_str());
    }
    for (name, wert) in &zusatz_header {
        http = http.header(name.as_str(), wert.as_str());
    }
    if let Some(k) = koerper {
        http = http.header(CONTENT_TYPE, "application/json").body(k);
    }
    if konfig.protokolle.log_sent_rest {
        tracing::debug!(
            route = %route,
            koerper = log_koerper.as_deref().unwrap_or("<leer>"),
            "REST-Anfrage gesendet"
        );
    }

    // 3. Dispatch
    let antwort = match http.send().await {
        Ok(a) => a,
        Err(e) => {
            let _ = egress.send(RequestAnswer::Error {
                route,
                ctx,
                ursache: PalaverError::Transport(e.to_string()),
            });
            return;
        }
    };

    // 4. Status-Triage und Parse
    let schnappschuss = schnappschuss_aus_headern(antwort.headers());
    let status = antwort.status();

    let ausgang = if status.as_u16() == 429 {
        // Koerper verwerfen, nur die Header zaehlen
        RequestAnswer::Ratelimited {
            route,
            ctx,
            is_global: schnappschuss.is_global,
            til_reset: schnappschuss.til_reset,
            uri_request_limit: schnappschuss.limit,
        }
    } else if status.is_success() {
        // 204 hat keinen Koerper; der Parser entscheidet ob leer gueltig ist
        let bytes = if status.as_u16() == 204 {
            Vec::new()
        } else {
            match antwort.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    let _ = egress.send(RequestAnswer::Error {
                        route,
                        ctx,
                        ursache: PalaverError::Transport(e.to_string()),
                    });
                    return;
                }
            }
        };
        if konfig.protokolle.log_received_rest {
            tracing::debug!(
                route = %route,
                status = status.as_u16(),
                koerper = %String::from_utf8_lossy(&bytes),
                "REST-Antwort empfangen"
            );
        }
        match parser(&bytes) {
            Ok(data) => RequestAnswer::Response {
                route,
                ctx,
                data,
                til_reset: schnappschuss.til_reset,
                remaining_requests: schnappschuss.remaining,
                uri_request_limit: schnappschuss.limit,
            },
            Err(e) => RequestAnswer::Error {
                route,
                ctx,
                ursache: PalaverError::Dekodierung(e),
            },
        }
    } else {
        let koerper = match antwort.bytes().await {
            Ok(b) => {
                let mut s = String::from_utf8_lossy(&b[..b.len().min(MAX_FEHLER_KOERPER)])
                    .into_owned();
                if b.len() > MAX_FEHLER_KOERPER {
                    s.push('…');
                }
                s
            }
            Err(_) => String::new(),
        };
        RequestAnswer::Error {
            route,
            ctx,
            ursache: PalaverError::Http {
                status: status.as_u16(),
                koerper,
            },
        }
    };

    // 5. Ledger-Rueckmeldung – vor dem Egress, damit der naechste
    // Request derselben Route den frischen Stand sieht
    if let Some(ledger) = &ledger {
        if let RequestAnswer::Ratelimited {
            is_global,
            til_reset,
            uri_request_limit,
            ..
        } = &ausgang
        {
            // Ein 429 erschoepft das Fenster bis zum mitgeteilten Reset.
            // Ohne Retry-After/Reset-Header traegt er keine durchsetzbare
            // Wartezeit; ein Update mit remaining=0 und unbekanntem Reset
            // wuerde den Bucket ohne Weckzeit festsetzen.
            if *til_reset > Duration::ZERO {
                ledger
                    .ratelimits_aktualisieren(
                        &raw_route,
                        *is_global,
                        *til_reset,
                        0,
                        *uri_request_limit,
                    )
                    .await;
            }
        } else if schnappschuss.ist_aussagekraeftig() {
            ledger
                .ratelimits_aktualisieren(
                    &raw_route,
                    false,
                    schnappschuss.til_reset,
                    schnappschuss.remaining,
                    schnappschuss.limit,
                )
                .await;
        }
    }

    // 6. Egress
    let _ = egress.send(ausgang);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_format() {
        let ua = user_agent();
        assert!(ua.starts_with("DiscordBot ("));
        assert!(ua.contains(PRODUKT_URL));
        assert!(ua.ends_with(&format!("{})", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    fn konfig_standardwerte() {
        let k = PipelineKonfig::neu("Bot token");
        assert_eq!(k.puffer_groesse, 64);
        assert_eq!(k.parallelitaet, 4);
        assert_eq!(k.ueberlauf_strategie, UeberlaufStrategie::Backpressure);
        assert_eq!(k.max_wartezeit, Duration::from_secs(60));
    }
}
