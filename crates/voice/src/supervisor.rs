//! Supervisor – Neustart-Schleife um die Voice-Sitzung
//!
//! Stirbt die Sitzung an einem terminalen Fehler (Protokollverletzung,
//! Transport-Tod, UDP-Helfer weg), erstellt der Supervisor sie nach
//! einer Wartezeit neu und nimmt die Resume-Daten mit, damit die neue
//! Sitzung sich unter derselben Identitaet wieder anmelden kann.
//!
//! Endet die Sitzung sauber (Logout), endet auch der Supervisor.

use std::time::Duration;

use palaver_core::config::{ProtokollEinstellungen, VoiceEinstellungen};
use palaver_core::Result;
use tokio::sync::mpsc;

use crate::session::{
    ResumeDaten, VoiceEreignis, VoiceKommando, VoiceSitzung, VoiceVerbindungsDaten,
};

/// Fuehrt die Sitzung unter Aufsicht aus bis zum sauberen Ende
///
/// Das Kommando-Handle bleibt ueber Neustarts hinweg dasselbe; der
/// Aufrufer merkt vom Neustart nur die Ereignis-Luecke.
pub async fn ueberwacht_ausfuehren(
    daten: VoiceVerbindungsDaten,
    voice_konfig: VoiceEinstellungen,
    protokolle: ProtokollEinstellungen,
    kommandos: &mut mpsc::Receiver<VoiceKommando>,
    ereignisse: mpsc::Sender<VoiceEreignis>,
    neustart_wartezeit: Duration,
) -> Result<()> {
    let mut resume: Option<ResumeDaten> = None;
    let mut sofort_login = false;

    loop {
        let sitzung = match resume.take() {
            Some(r) => VoiceSitzung::neu_mit_resume(
                daten.clone(),
                r,
                voice_konfig,
                protokolle,
                ereignisse.clone(),
            ),
            None => VoiceSitzung::neu(
                daten.clone(),
                voice_konfig,
                protokolle,
                ereignisse.clone(),
            ),
        };

        let ausgang = sitzung.ausfuehren(kommandos, sofort_login).await;
        match ausgang.ergebnis {
            Ok(()) => return Ok(()),
            Err(fehler) => {
                tracing::warn!(
                    fehler = %fehler,
                    wartezeit_ms = neustart_wartezeit.as_millis() as u64,
                    "Voice-Sitzung gestorben, Neustart mit Resume-Daten"
                );
                resume = Some(ausgang.resume);
                sofort_login = true;
                tokio::time::sleep(neustart_wartezeit).await;
            }
        }
    }
}
