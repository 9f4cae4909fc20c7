//! Typisierte Requests
//!
//! Ein `Request<D, C>` buendelt alles was die Pipeline zum Ausfuehren
//! braucht: Route, optionaler JSON-Koerper, Zusatz-Header, optionale
//! Audit-Log-Begruendung, einen opaken Aufrufer-Kontext und den Parser
//! fuer die dekodierte Antwort `D`.
//!
//! Frueher ueber mehrere Trait-Bausteine verteilt (mit/ohne Koerper,
//! mit/ohne Antwort, mit Begruendung); hier ein einzelner Record mit
//! optionalen Feldern und einem kleinen Builder.

use std::sync::Arc;

use palaver_core::{PalaverError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::route::Route;

/// Maximale Laenge der Audit-Log-Begruendung in Zeichen
pub const MAX_BEGRUENDUNG_LAENGE: usize = 512;

/// Obergrenze fuer die Log-Darstellung eines Koerpers
const MAX_LOG_KOERPER: usize = 1024;

/// Antwort-Parser: rohe Bytes -> dekodierter Wert
pub type Parser<D> = Arc<dyn Fn(&[u8]) -> serde_json::Result<D> + Send + Sync>;

/// Hook der die Log-Darstellung des Koerpers liefert (z.B. geschwaerzt)
pub type LogHook = Arc<dyn Fn() -> String + Send + Sync>;

/// Ein einzelner typisierter Request
///
/// `D` ist der dekodierte Antwort-Typ, `C` der opake Aufrufer-Kontext.
/// Der Kontext wird unveraendert durch die Pipeline gereicht und kommt
/// in genau einer Antwort wieder heraus.
pub struct Request<D, C> {
    /// Route mit Methode, URI und Raw-Route
    pub route: Route,
    /// Optionaler Anfragekoerper (JSON-Bytes)
    pub koerper: Option<Vec<u8>>,
    /// Zusaetzliche Header
    pub zusatz_header: Vec<(String, String)>,
    /// Optionale Audit-Log-Begruendung (validiert, nie gekuerzt)
    pub begruendung: Option<String>,
    /// Opaker Aufrufer-Kontext
    pub ctx: C,
    /// Parser fuer den Antwortkoerper
    pub parser: Parser<D>,
    /// Optionaler Hook fuer die Log-Darstellung des Koerpers
    pub log_hook: Option<LogHook>,
}

impl<D, C> Request<D, C> {
    /// Startet einen Builder fuer einen Request mit JSON-dekodierter Antwort
    pub fn json(route: Route, ctx: C) -> RequestBuilder<D, C>
    where
        D: DeserializeOwned,
    {
        RequestBuilder::neu(
            route,
            ctx,
            Arc::new(|bytes: &[u8]| serde_json::from_slice::<D>(bytes)),
        )
    }

    /// Startet einen Builder mit explizitem Parser
    pub fn mit_parser(route: Route, ctx: C, parser: Parser<D>) -> RequestBuilder<D, C> {
        RequestBuilder::neu(route, ctx, parser)
    }

    /// Gibt die Log-Darstellung des Koerpers zurueck
    ///
    /// Bevorzugt den Hook; sonst UTF-8-lossy, auf `MAX_LOG_KOERPER`
    /// Zeichen begrenzt.
    pub fn koerper_fuer_log(&self) -> Option<String> {
        if let Some(hook) = &self.log_hook {
            return Some(hook());
        }
        self.koerper.as_ref().map(|k| {
            let s = String::from_utf8_lossy(k);
            if s.chars().count() > MAX_LOG_KOERPER {
                let mut gekuerzt: String = s.chars().take(MAX_LOG_KOERPER).collect();
                gekuerzt.push('…');
                gekuerzt
            } else {
                s.into_owned()
            }
        })
    }
}

impl<C> Request<(), C> {
    /// Builder fuer Requests ohne erwarteten Antwortkoerper
    ///
    /// Der Parser akzeptiert jeden (auch leeren) Koerper und liefert `()`.
    pub fn ohne_antwort(route: Route, ctx: C) -> RequestBuilder<(), C> {
        RequestBuilder::neu(route, ctx, Arc::new(|_bytes: &[u8]| Ok(())))
    }
}

impl<D, C: Clone> Clone for Request<D, C> {
    fn clone(&self) -> Self {
        Self {
            route: self.route.clone(),
            koerper: self.koerper.clone(),
            zusatz_header: self.zusatz_header.clone(),
            begruendung: self.begruendung.clone(),
            ctx: self.ctx.clone(),
            parser: Arc::clone(&self.parser),
            log_hook: self.log_hook.as_ref().map(Arc::clone),
        }
    }
}

impl<D, C: std::fmt::Debug> std::fmt::Debug for Request<D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("route", &self.route)
            .field("koerper_bytes", &self.koerper.as_ref().map(Vec::len))
            .field("zusatz_header", &self.zusatz_header)
            .field("begruendung", &self.begruendung)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RequestBuilder
// ---------------------------------------------------------------------------

/// Builder fuer `Request`
pub struct RequestBuilder<D, C> {
    route: Route,
    koerper: Option<Vec<u8>>,
    zusatz_header: Vec<(String, String)>,
    begruendung: Option<String>,
    ctx: C,
    parser: Parser<D>,
    log_hook: Option<LogHook>,
}

impl<D, C> RequestBuilder<D, C> {
    fn neu(route: Route, ctx: C, parser: Parser<D>) -> Self {
        Self {
            route,
            koerper: None,
            zusatz_header: Vec::new(),
            begruendung: None,
            ctx,
            parser,
            log_hook: None,
        }
    }

    /// Setzt den Anfragekoerper aus einem serialisierbaren Wert
    pub fn koerper_json<T: Serialize>(mut self, wert: &T) -> Result<Self> {
        self.koerper = Some(serde_json::to_vec(wert)?);
        Ok(self)
    }

    /// Setzt den Anfragekoerper aus rohen Bytes
    pub fn koerper_roh(mut self, bytes: Vec<u8>) -> Self {
        self.koerper = Some(bytes);
        self
    }

    /// Fuegt einen zusaetzlichen Header hinzu
    pub fn header(mut self, name: impl Into<String>, wert: impl Into<String>) -> Self {
        self.zusatz_header.push((name.into(), wert.into()));
        self
    }

    /// Setzt die Audit-Log-Begruendung
    ///
    /// # Fehler
    /// `BegruendungZuLang` wenn die Begruendung mehr als 512 Zeichen
    /// hat. Sie wird nie gekuerzt uebertragen.
    pub fn begruendung(mut self, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let laenge = text.chars().count();
        if laenge > MAX_BEGRUENDUNG_LAENGE {
            return Err(PalaverError::BegruendungZuLang(laenge));
        }
        self.begruendung = Some(text);
        Ok(self)
    }

    /// Setzt den Hook fuer die Log-Darstellung des Koerpers
    pub fn log_hook(mut self, hook: LogHook) -> Self {
        self.log_hook = Some(hook);
        self
    }

    /// Baut den fertigen Request
    pub fn bauen(self) -> Request<D, C> {
        Request {
            route: self.route,
            koerper: self.koerper,
            zusatz_header: self.zusatz_header,
            begruendung: self.begruendung,
            ctx: self.ctx,
            parser: self.parser,
            log_hook: self.log_hook,
        }
    }
}
