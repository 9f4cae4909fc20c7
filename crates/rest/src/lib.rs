//! palaver-rest – Ratelimit-bewusste REST-Request-Pipeline
//!
//! Dieser Crate implementiert den Request-Fluss zum Chat-Dienst:
//! typisierte Requests gehen hinein, strukturierte Antworten kommen
//! heraus, und die vom Dienst auferlegten Rate-Limits werden dabei
//! eingehalten.
//!
//! ## Architektur
//!
//! ```text
//! Aufrufer
//!     |  Request<D, C>
//!     v
//! BegrenzterPuffer (Ingress, Ueberlauf-Strategie)
//!     |
//!     v
//! RatelimitLedger-Tor (WantToPass, Timeout -> Dropped)
//!     |
//!     v
//! HTTP-Dispatch (reqwest, geteilter Connection-Pool, Parallelitaet p)
//!     |
//!     v
//! Antwort-Parse (429 / 204 / Fehler / Erfolg)
//!     |                     \
//!     v                      +--> UpdateRatelimits --> RatelimitLedger
//! RequestAnswer<D, C> (Egress, Reihenfolge nicht garantiert)
//! ```
//!
//! Der Retry-Harness (`retry`) legt sich um die Pipeline und speist
//! fehlgeschlagene Requests ueber einen Vorzugskanal wieder ein.

pub mod answer;
pub mod buffer;
pub mod flows;
pub mod headers;
pub mod ledger;
pub mod pipeline;
pub mod request;
pub mod retry;
pub mod route;

// Bequeme Re-Exporte
pub use answer::RequestAnswer;
pub use buffer::{BegrenzterPuffer, PufferFehler, UeberlaufStrategie};
pub use flows::{
    add_ordering, data_responses, request_flow, request_flow_without_ratelimit,
    retry_request_flow,
};
pub use ledger::RatelimitLedger;
pub use pipeline::{PipelineKonfig, PipelineZugang, RequestPipeline};
pub use request::Request;
pub use route::{Methode, Route};
