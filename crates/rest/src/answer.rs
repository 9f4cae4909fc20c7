//! Antwort-Varianten der Pipeline
//!
//! Jeder Request erzeugt genau eine Antwort. `Response` ist die einzige
//! erfolgreiche Variante; `Ratelimited`, `Error` und `Dropped` bilden
//! zusammen die fehlgeschlagene Menge, die der Retry-Harness wieder
//! einspeisen kann.

use std::time::Duration;

use palaver_core::PalaverError;

use crate::route::Route;

/// Ausgang eines einzelnen Requests
///
/// Jede Variante traegt die Route (und damit die Raw-Route) sowie den
/// opaken Aufrufer-Kontext `C` unveraendert weiter.
#[derive(Debug)]
pub enum RequestAnswer<D, C> {
    /// Erfolg mit dekodierter Nutzlast und Ratelimit-Momentaufnahme
    Response {
        route: Route,
        ctx: C,
        data: D,
        /// Zeit bis zum Zuruecksetzen des Buckets
        til_reset: Duration,
        /// Verbleibende Requests im Fenster (-1 wenn unbekannt)
        remaining_requests: i64,
        /// Fenster-Limit des Buckets (-1 wenn unbekannt)
        uri_request_limit: i64,
    },
    /// Der Dienst hat mit 429 geantwortet
    Ratelimited {
        route: Route,
        ctx: C,
        /// Gilt das Limit prozessweit fuer alle Routen?
        is_global: bool,
        /// Wartezeit bis zum naechsten Versuch
        til_reset: Duration,
        /// Fenster-Limit des Buckets (-1 wenn unbekannt)
        uri_request_limit: i64,
    },
    /// Transportfehler oder Nicht-Erfolgs-Status (ausser 429)
    Error {
        route: Route,
        ctx: C,
        ursache: PalaverError,
    },
    /// Das Ledger-Tor hat den Request innerhalb der maximalen
    /// Wartezeit nicht durchgelassen
    Dropped { route: Route, ctx: C },
}

impl<D, C> RequestAnswer<D, C> {
    /// Ist dies die erfolgreiche Variante?
    pub fn ist_erfolg(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// Ist dies eine der fehlgeschlagenen Varianten?
    pub fn ist_fehlschlag(&self) -> bool {
        !self.ist_erfolg()
    }

    /// Die Route des urspruenglichen Requests
    pub fn route(&self) -> &Route {
        match self {
            Self::Response { route, .. }
            | Self::Ratelimited { route, .. }
            | Self::Error { route, .. }
            | Self::Dropped { route, .. } => route,
        }
    }

    /// Die Raw-Route (Bucket-Schluessel) des urspruenglichen Requests
    pub fn raw_route(&self) -> &str {
        &self.route().raw_route
    }

    /// Referenz auf den Aufrufer-Kontext
    pub fn ctx(&self) -> &C {
        match self {
            Self::Response { ctx, .. }
            | Self::Ratelimited { ctx, .. }
            | Self::Error { ctx, .. }
            | Self::Dropped { ctx, .. } => ctx,
        }
    }

    /// Zerlegt die erfolgreiche Variante in `(data, ctx)`
    pub fn in_erfolg(self) -> Option<(D, C)> {
        match self {
            Self::Response { data, ctx, .. } => Some((data, ctx)),
            _ => None,
        }
    }

    /// Bildet den Kontext ab ohne die uebrigen Felder anzufassen
    pub fn ctx_abbilden<C2>(self, f: impl FnOnce(C) -> C2) -> RequestAnswer<D, C2> {
        match self {
            Self::Response {
                route,
                ctx,
                data,
                til_reset,
                remaining_requests,
                uri_request_limit,
            } => RequestAnswer::Response {
                route,
                ctx: f(ctx),
                data,
                til_reset,
                remaining_requests,
                uri_request_limit,
            },
            Self::Ratelimited {
                route,
                ctx,
                is_global,
                til_reset,
                uri_request_limit,
            } => RequestAnswer::Ratelimited {
                route,
                ctx: f(ctx),
                is_global,
                til_reset,
                uri_request_limit,
            },
            Self::Error {
                route,
                ctx,
                ursache,
            } => RequestAnswer::Error {
                route,
                ctx: f(ctx),
                ursache,
            },
            Self::Dropped { route, ctx } => RequestAnswer::Dropped {
                route,
                ctx: f(ctx),
            },
        }
    }
}
