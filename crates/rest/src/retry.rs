//! Retry-Harness – begrenzte Wiederholung fehlgeschlagener Requests
//!
//! Legt sich um die Pipeline: jeder eingehende Request wird mit einem
//! Versuchszaehler und einer Kopie seiner selbst verpackt. Schlaegt ein
//! Versuch fehl, wandert der Original-Request ueber den Vorzugskanal
//! zurueck an den Pipeline-Eingang – Wiederholungen springen vor
//! frischen Eingang, sonst koennte der Rueckkanal unter Backpressure
//! verklemmen.
//!
//! Heraus kommen nur erfolgreiche Antworten. Requests deren Versuche
//! erschoepft sind werden mit einer Warnung verworfen (siehe
//! DESIGN.md). Ratelimit-Fehlschlaege warten beim naechsten Versuch
//! typischerweise am Ledger-Tor statt erneut auf die Leitung zu gehen,
//! weil die Pipeline den 429 bereits eingepflegt hat.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::answer::RequestAnswer;
use crate::buffer::BegrenzterPuffer;
use crate::pipeline::{PipelineZugang, RequestPipeline};
use crate::request::Request;

/// Innerer Kontext der Pipeline-Durchlaeufe des Harness
///
/// Traegt den Versuchszaehler und den Original-Request, damit ein
/// Fehlschlag ohne weitere Buchfuehrung erneut eingespeist werden kann.
pub struct VersuchKontext<D, C> {
    /// Nummer dieses Versuchs (0-basiert)
    pub versuch: u32,
    /// Der unveraenderte Original-Request des Aufrufers
    pub original: Request<D, C>,
}

/// Verpackt einen Request fuer einen Pipeline-Durchlauf
fn einpacken<D, C>(original: Request<D, C>, versuch: u32) -> Request<D, VersuchKontext<D, C>> {
    Request {
        route: original.route.clone(),
        koerper: original.koerper.clone(),
        zusatz_header: original.zusatz_header.clone(),
        begruendung: original.begruendung.clone(),
        parser: Arc::clone(&original.parser),
        log_hook: original.log_hook.as_ref().map(Arc::clone),
        ctx: VersuchKontext { versuch, original },
    }
}

/// Startet einen Fluss der Fehlschlaege bis zu `max_versuche` Mal
/// wiederholt und nur Erfolge herausgibt
///
/// `max_versuche` zaehlt HTTP-Versuche insgesamt: bei 3 wird ein
/// Request hoechstens dreimal auf die Leitung gelegt.
pub fn retry_request_flow<D, C>(
    pipeline: &RequestPipeline,
    max_versuche: u32,
) -> (
    PipelineZugang<D, C>,
    mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
)
where
    D: Send + 'static,
    C: Send + 'static,
{
    let max_versuche = max_versuche.max(1);
    let (vorzug_tx, inner_zugang, mut inner_rx) =
        pipeline.starten_mit_vorzugskanal::<D, VersuchKontext<D, C>>();

    let aussen_puffer = BegrenzterPuffer::neu(
        pipeline.konfig().puffer_groesse,
        pipeline.konfig().ueberlauf_strategie,
    );
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let aussen = aussen_puffer.clone();
    tokio::spawn(async move {
        let mut vorzug_tx = Some(vorzug_tx);
        let mut offen: u64 = 0;
        let mut eingang_zu = false;

        loop {
            tokio::select! {
                biased;
                antwort = inner_rx.recv() => {
                    match antwort {
                        Some(a) => {
                            if !antwort_verarbeiten(a, max_versuche, &vorzug_tx, &out_tx, &mut offen) {
                                break;
                            }
                        }
                        // Pipeline fertig oder gestorben
                        None => break,
                    }
                }
                anfrage = aussen.entnehmen(), if !eingang_zu => {
                    match anfrage {
                        Some(r) => {
                            offen += 1;
                            if inner_zugang.senden(einpacken(r, 0)).await.is_err() {
                                break;
                            }
                        }
                        None => eingang_zu = true,
                    }
                }
            }

            // Eingang zu und alles beantwortet: Pipeline herunterfahren,
            // dann den Rest des Egress leeren
            if eingang_zu && offen == 0 {
                inner_zugang.schliessen();
                vorzug_tx = None;
            }
        }

        // Aufraeumen, auch wenn der Aufrufer den Ausgang fallen liess
        aussen.schliessen();
        inner_zugang.schliessen();
    });

    (
        PipelineZugang {
            puffer: aussen_puffer,
        },
        out_rx,
    )
}

/// Verarbeitet eine Pipeline-Antwort; false beendet den Harness
fn antwort_verarbeiten<D, C>(
    antwort: RequestAnswer<D, VersuchKontext<D, C>>,
    max_versuche: u32,
    vorzug_tx: &Option<mpsc::UnboundedSender<Request<D, VersuchKontext<D, C>>>>,
    out_tx: &mpsc::UnboundedSender<RequestAnswer<D, C>>,
    offen: &mut u64,
) -> bool {
    match antwort {
        RequestAnswer::Response {
            route,
            ctx,
            data,
            til_reset,
            remaining_requests,
            uri_request_limit,
        } => {
            *offen = offen.saturating_sub(1);
            // Kontext auspacken: der Aufrufer sieht seinen eigenen Ctx
            out_tx
                .send(RequestAnswer::Response {
                    route,
                    ctx: ctx.original.ctx,
                    data,
                    til_reset,
                    remaining_requests,
                    uri_request_limit,
                })
                .is_ok()
        }
        RequestAnswer::Ratelimited { ctx, .. }
        | RequestAnswer::Error { ctx, .. }
        | RequestAnswer::Dropped { ctx, .. } => {
            let naechster = ctx.versuch + 1;
            if naechster < max_versuche {
                tracing::debug!(
                    raw_route = %ctx.original.route.raw_route,
                    versuch = naechster,
                    "Fehlgeschlagenen Request erneut eingespeist"
                );
                if let Some(tx) = vorzug_tx {
                    return tx.send(einpacken(ctx.original, naechster)).is_ok();
                }
                true
            } else {
                tracing::warn!(
                    raw_route = %ctx.original.route.raw_route,
                    versuche = naechster,
                    "Wiederholungen erschoepft, Request verworfen"
                );
                *offen = offen.saturating_sub(1);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Methode, Route};

    fn test_request() -> Request<serde_json::Value, u32> {
        Request::json(Route::ohne_parameter(Methode::Get, "/v1/x"), 42)
            .header("X-Probe", "1")
            .bauen()
    }

    #[test]
    fn einpacken_kopiert_request_felder() {
        let original = test_request();
        let verpackt = einpacken(original, 0);
        assert_eq!(verpackt.route.raw_route, "GET /v1/x");
        assert_eq!(verpackt.zusatz_header.len(), 1);
        assert_eq!(verpackt.ctx.versuch, 0);
        assert_eq!(verpackt.ctx.original.ctx, 42);
    }

    #[test]
    fn einpacken_erhaelt_versuchszaehler() {
        let original = test_request();
        let erster = einpacken(original, 0);
        let zweiter = einpacken(erster.ctx.original, 1);
        assert_eq!(zweiter.ctx.versuch, 1);
        assert_eq!(zweiter.ctx.original.ctx, 42);
    }
}
