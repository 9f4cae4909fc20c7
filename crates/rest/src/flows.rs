//! Aufrufer-Schnittstelle der REST-Pipeline
//!
//! Drei Fluesse plus zwei Adapter:
//!
//! - [`request_flow_without_ratelimit`] – Dispatch ohne Ledger-Tor
//! - [`request_flow`] – der normale ratelimit-bewusste Fluss
//! - [`retry_request_flow`] – Fehlschlaege werden begrenzt wiederholt,
//!   nur Erfolge kommen heraus
//! - [`data_responses`] – filtert einen Antwortstrom auf `(data, ctx)`
//! - [`add_ordering`] – stellt Reihenfolge wieder her, auf Kosten des
//!   Durchsatzes (serialisiert die innere Pipeline Element fuer Element)

use palaver_core::Result;
use tokio::sync::mpsc;

use crate::answer::RequestAnswer;
use crate::buffer::BegrenzterPuffer;
use crate::ledger::RatelimitLedger;
use crate::pipeline::{PipelineKonfig, PipelineZugang, RequestPipeline};

/// Startet einen Fluss der Rate-Limits ignoriert
///
/// Requests gehen direkt auf die Leitung; Antworten tragen trotzdem
/// die Ratelimit-Momentaufnahme ihrer Header.
pub fn request_flow_without_ratelimit<D, C>(
    konfig: PipelineKonfig,
) -> Result<(
    PipelineZugang<D, C>,
    mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
)>
where
    D: Send + 'static,
    C: Send + 'static,
{
    Ok(RequestPipeline::neu(konfig, None)?.starten())
}

/// Startet den normalen ratelimit-bewussten Fluss
///
/// Das Ledger kann zwischen mehreren Fluessen geteilt werden; alle
/// sehen dann dieselbe Bucket-Tabelle.
pub fn request_flow<D, C>(
    konfig: PipelineKonfig,
    ledger: RatelimitLedger,
) -> Result<(
    PipelineZugang<D, C>,
    mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
)>
where
    D: Send + 'static,
    C: Send + 'static,
{
    Ok(RequestPipeline::neu(konfig, Some(ledger))?.starten())
}

/// Startet den Fluss mit Wiederholungs-Harness
///
/// Nur erfolgreiche Antworten kommen heraus; erschoepfte Requests
/// werden mit Warnung verworfen.
pub fn retry_request_flow<D, C>(
    konfig: PipelineKonfig,
    ledger: RatelimitLedger,
    max_versuche: u32,
) -> Result<(
    PipelineZugang<D, C>,
    mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
)>
where
    D: Send + 'static,
    C: Send + 'static,
{
    let pipeline = RequestPipeline::neu(konfig, Some(ledger))?;
    Ok(crate::retry::retry_request_flow(&pipeline, max_versuche))
}

/// Filtert einen Antwortstrom auf die erfolgreichen `(data, ctx)`-Paare
///
/// Fehlgeschlagene Antworten werden mit trace-Log verworfen.
pub fn data_responses<D, C>(
    mut antworten: mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
) -> mpsc::UnboundedReceiver<(D, C)>
where
    D: Send + 'static,
    C: Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(antwort) = antworten.recv().await {
            match antwort.in_erfolg() {
                Some(paar) => {
                    if tx.send(paar).is_err() {
                        break;
                    }
                }
                None => tracing::trace!("Fehlgeschlagene Antwort ausgefiltert"),
            }
        }
    });
    rx
}

/// Startet einen Fluss der die Eingabe-Reihenfolge der Antworten
/// garantiert
///
/// Die innere Pipeline wird Element fuer Element betrieben: der
/// naechste Request geht erst auf die Reise wenn die Antwort des
/// vorigen da ist. Gedacht als Debug-Hilfe, nicht fuer Durchsatz.
pub fn add_ordering<D, C>(
    konfig: PipelineKonfig,
    ledger: Option<RatelimitLedger>,
) -> Result<(
    PipelineZugang<D, C>,
    mpsc::UnboundedReceiver<RequestAnswer<D, C>>,
)>
where
    D: Send + 'static,
    C: Send + 'static,
{
    let puffer_groesse = konfig.puffer_groesse;
    let strategie = konfig.ueberlauf_strategie;
    let pipeline = RequestPipeline::neu(konfig, ledger)?;
    let (inner_zugang, mut inner_rx) = pipeline.starten();

    let aussen_puffer = BegrenzterPuffer::neu(puffer_groesse, strategie);
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let aussen = aussen_puffer.clone();
    tokio::spawn(async move {
        while let Some(anfrage) = aussen.entnehmen().await {
            if inner_zugang.senden(anfrage).await.is_err() {
                break;
            }
            match inner_rx.recv().await {
                Some(antwort) => {
                    if out_tx.send(antwort).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        aussen.schliessen();
        inner_zugang.schliessen();
    });

    Ok((
        PipelineZugang {
            puffer: aussen_puffer,
        },
        out_rx,
    ))
}
