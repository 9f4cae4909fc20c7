//! Begrenzter Ingress-Puffer mit Ueberlauf-Strategien
//!
//! Der Eingang der Pipeline ist eine Schlange mit fester Kapazitaet.
//! Laeuft sie voll, entscheidet die konfigurierte Strategie:
//!
//! - `Backpressure`: der Produzent wartet bis Platz frei wird
//! - `DropNewest`: das neue Element wird verworfen
//! - `DropOldest`: das aelteste Element weicht dem neuen
//! - `DropBuffer`: die gesamte Schlange wird geleert
//! - `Fail`: das Einreihen schlaegt fehl
//!
//! tokio-Kanaele koennen nur Backpressure ausdruecken, deshalb ist die
//! Schlange von Hand gebaut: VecDeque unter einem parking_lot-Mutex,
//! Weckrufe via tokio::sync::Notify.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Verhalten wenn der Puffer voll ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeberlaufStrategie {
    /// Produzent wartet bis Platz frei wird
    Backpressure,
    /// Neues Element verwerfen
    DropNewest,
    /// Aeltestes Element verwerfen
    DropOldest,
    /// Gesamten Puffer leeren
    DropBuffer,
    /// Einreihen schlaegt fehl
    Fail,
}

/// Fehler beim Einreihen
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PufferFehler {
    #[error("Puffer voll")]
    Voll,
    #[error("Puffer geschlossen")]
    Geschlossen,
}

struct Zustand<T> {
    schlange: VecDeque<T>,
    geschlossen: bool,
}

struct PufferInner<T> {
    zustand: Mutex<Zustand<T>>,
    nicht_leer: Notify,
    nicht_voll: Notify,
    kapazitaet: usize,
    strategie: UeberlaufStrategie,
}

/// Begrenzte Schlange mit konfigurierbarer Ueberlauf-Strategie
///
/// Clonebar; alle Klone teilen denselben Zustand.
pub struct BegrenzterPuffer<T> {
    inner: Arc<PufferInner<T>>,
}

impl<T> Clone for BegrenzterPuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BegrenzterPuffer<T> {
    /// Erstellt einen Puffer mit Kapazitaet und Strategie
    pub fn neu(kapazitaet: usize, strategie: UeberlaufStrategie) -> Self {
        Self {
            inner: Arc::new(PufferInner {
                zustand: Mutex::new(Zustand {
                    schlange: VecDeque::with_capacity(kapazitaet.max(1)),
                    geschlossen: false,
                }),
                nicht_leer: Notify::new(),
                nicht_voll: Notify::new(),
                kapazitaet: kapazitaet.max(1),
                strategie,
            }),
        }
    }

    /// Reiht ein Element ein und wendet bei vollem Puffer die Strategie an
    ///
    /// Bei `DropNewest`, `DropOldest` und `DropBuffer` gelingt der
    /// Aufruf auch am vollen Puffer; verworfene Elemente sind verloren.
    pub async fn einreihen(&self, element: T) -> Result<(), PufferFehler> {
        let inner = &self.inner;
        match inner.strategie {
            UeberlaufStrategie::Backpressure => {
                let mut element = Some(element);
                loop {
                    let benachrichtigung = inner.nicht_voll.notified();
                    {
                        let mut z = inner.zustand.lock();
                        if z.geschlossen {
                            return Err(PufferFehler::Geschlossen);
                        }
                        if z.schlange.len() < inner.kapazitaet {
                            if let Some(el) = element.take() {
                                z.schlange.push_back(el);
                            }
                            inner.nicht_leer.notify_one();
                            return Ok(());
                        }
                    }
                    benachrichtigung.await;
                }
            }
            strategie => {
                let mut z = inner.zustand.lock();
                if z.geschlossen {
                    return Err(PufferFehler::Geschlossen);
                }
                if z.schlange.len() >= inner.kapazitaet {
                    match strategie {
                        UeberlaufStrategie::DropNewest => {
                            tracing::debug!("Puffer voll, neues Element verworfen");
                            return Ok(());
                        }
                        UeberlaufStrategie::DropOldest => {
                            z.schlange.pop_front();
                            tracing::debug!("Puffer voll, aeltestes Element verworfen");
                        }
                        UeberlaufStrategie::DropBuffer => {
                            let verworfen = z.schlange.len();
                            z.schlange.clear();
                            tracing::debug!(verworfen, "Puffer voll, Schlange geleert");
                        }
                        UeberlaufStrategie::Fail => return Err(PufferFehler::Voll),
                        UeberlaufStrategie::Backpressure => unreachable!(),
                    }
                }
                z.schlange.push_back(element);
                inner.nicht_leer.notify_one();
                Ok(())
            }
        }
    }

    /// Entnimmt das aelteste Element; `None` wenn geschlossen und leer
    pub async fn entnehmen(&self) -> Option<T> {
        let inner = &self.inner;
        loop {
            let benachrichtigung = inner.nicht_leer.notified();
            {
                let mut z = inner.zustand.lock();
                if let Some(el) = z.schlange.pop_front() {
                    inner.nicht_voll.notify_one();
                    return Some(el);
                }
                if z.geschlossen {
                    return None;
                }
            }
            benachrichtigung.await;
        }
    }

    /// Schliesst den Puffer; wartende Produzenten und Konsumenten
    /// werden geweckt. Bereits eingereihte Elemente bleiben entnehmbar.
    pub fn schliessen(&self) {
        let mut z = self.inner.zustand.lock();
        z.geschlossen = true;
        drop(z);
        self.inner.nicht_leer.notify_waiters();
        self.inner.nicht_voll.notify_waiters();
    }

    /// Anzahl aktuell eingereihter Elemente
    pub fn laenge(&self) -> usize {
        self.inner.zustand.lock().schlange.len()
    }

    /// Ist der Puffer geschlossen?
    pub fn ist_geschlossen(&self) -> bool {
        self.inner.zustand.lock().geschlossen
    }
}
