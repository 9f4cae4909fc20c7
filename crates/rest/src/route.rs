//! Routen – HTTP-Methode, konkrete URI und Raw-Route
//!
//! Rate-Limits werden nicht pro konkreter URI gefuehrt, sondern pro
//! *Raw-Route*: Methode plus Pfad-Template mit maskierten IDs. Zwei
//! URIs mit identischer Methode und identischem Template teilen sich
//! denselben Bucket.

/// HTTP-Methode einer Route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Methode {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Methode {
    /// Konvertiert in die reqwest-Darstellung
    pub fn als_http(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }

    /// Name der Methode in Grossbuchstaben
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Methode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Eine Route: Methode, konkrete URI und der Rate-Limit-Schluessel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// HTTP-Methode
    pub methode: Methode,
    /// Vollstaendige konkrete URI (mit eingesetzten IDs)
    pub uri: String,
    /// Raw-Route: Methode + Template mit Platzhaltern, Bucket-Schluessel
    pub raw_route: String,
}

impl Route {
    /// Erstellt eine Route aus Template und konkreter URI
    ///
    /// Das Template behaelt seine Platzhalter (`{user_id}` etc.); die
    /// Raw-Route ergibt sich aus Methode und Template.
    pub fn neu(methode: Methode, template: &str, uri: impl Into<String>) -> Self {
        Self {
            methode,
            uri: uri.into(),
            raw_route: format!("{} {}", methode.name(), template),
        }
    }

    /// Erstellt eine Route ohne Pfad-Parameter (Template == Pfad)
    pub fn ohne_parameter(methode: Methode, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            raw_route: format!("{} {}", methode.name(), uri),
            methode,
            uri,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.methode, self.uri)
    }
}
