//! Voice-Sitzung – Zustandsmaschine ueber dem WebSocket
//!
//! Eine Sitzung ist ein einzelner Task mit genau einer Ereignis-
//! Schleife: zu jedem Zeitpunkt wird hoechstens ein Ereignis
//! verarbeitet. Timer und eingehende Nachrichten serialisieren sich
//! durch das `select!`.
//!
//! ## Zustaende
//!
//! ```text
//! Inaktiv --Login--> Aktiv(MitQueue)      Identify gesendet
//!     ^                  |  Hello
//!     |                  v
//!     |              Aktiv(MitHeartbeat)  Timer bei 0.75 x Intervall
//!     |                  |  Ready
//!     |                  v
//!     +--Restart---- Aktiv(MitUdp)        UDP-Helfer, IP-Entdeckung,
//!                                         SelectProtocol, Schluessel
//! ```
//!
//! Der Zustand sammelt waehrend des Handshakes monoton Detail an und
//! faellt im Aktiv-Zustand nie zurueck. Ein Heartbeat geht nur raus
//! wenn das vorige ACK da ist; eine fremde Nonce im ACK ist eine
//! terminale Protokollverletzung.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use palaver_core::config::{ProtokollEinstellungen, VoiceEinstellungen};
use palaver_core::{PalaverError, Result, ServerId, SessionId, UserId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::{
    IdentifyDaten, ProtokollDetails, SelectProtocolDaten, SpeakingDaten, VoiceNachricht,
    MODUS_XSALSA20,
};
use crate::udp::{UdpEreignis, UdpHelfer, UdpHelferHandle};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Anteil des Hello-Intervalls nach dem der Heartbeat-Timer feuert
const HEARTBEAT_FAKTOR: (u64, u64) = (3, 4);

// ---------------------------------------------------------------------------
// Daten-Typen
// ---------------------------------------------------------------------------

/// Resume-Daten: reichen aus um sich nach einem Neustart wieder
/// anzumelden
#[derive(Debug, Clone)]
pub struct ResumeDaten {
    pub server_id: ServerId,
    pub session_id: SessionId,
    pub token: String,
}

/// Verbindungsdaten der Voice-Sitzung
#[derive(Debug, Clone)]
pub struct VoiceVerbindungsDaten {
    /// Endpunkt-Adresse; ein `ws://`/`wss://`-Praefix wird uebernommen,
    /// sonst wird `wss://` vorangestellt
    pub adresse: String,
    /// Protokollversion fuer den `?v=`-Parameter
    pub version: u8,
    pub server_id: ServerId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
}

impl VoiceVerbindungsDaten {
    /// Baut die Gateway-URL `wss://<adresse>?v=<version>`
    pub fn gateway_url(&self) -> String {
        if self.adresse.starts_with("ws://") || self.adresse.starts_with("wss://") {
            format!("{}?v={}", self.adresse, self.version)
        } else {
            format!("wss://{}?v={}", self.adresse, self.version)
        }
    }

    fn resume(&self) -> ResumeDaten {
        ResumeDaten {
            server_id: self.server_id,
            session_id: self.session_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Kommandos des Aufrufers an die Sitzung
#[derive(Debug)]
pub enum VoiceKommando {
    /// Sitzung aufbauen (nur im Zustand Inaktiv wirksam)
    Login,
    /// Sitzung sauber beenden
    Logout,
    /// Sitzung beenden und nach `wartezeit` neu anmelden;
    /// `fresh = false` nimmt die Resume-Daten mit
    Restart { fresh: bool, wartezeit: Duration },
    /// Eigenen Sprech-Status setzen (nur mit fertigem Handshake)
    SetzeSpeaking(bool),
}

/// Ereignisse der Sitzung an den Aufrufer
#[derive(Debug, PartialEq)]
pub enum VoiceEreignis {
    /// Ready empfangen, SSRC zugeteilt
    Verbunden { ssrc: u32 },
    /// Die externe Adresse ist entdeckt
    IpEntdeckt { adresse: String, port: u16 },
    /// Sitzungsschluessel empfangen und an den UDP-Helfer uebergeben
    SitzungAktiv,
    /// Ein Teilnehmer hat seinen Sprech-Status geaendert
    Spricht { ssrc: u32, speaking: bool },
    /// Sauber beendet
    Getrennt,
}

/// Ausgang einer Sitzung: Ergebnis plus Resume-Daten fuer den
/// Supervisor
#[derive(Debug)]
pub struct SitzungsAusgang {
    pub ergebnis: Result<()>,
    pub resume: ResumeDaten,
}

// ---------------------------------------------------------------------------
// Aktiv-Zustand
// ---------------------------------------------------------------------------

/// Fortschritt des Handshakes; sammelt monoton Detail an
enum AktivDetail {
    /// Identify gesendet, Hello steht aus
    MitQueue,
    /// Heartbeat-Timer laeuft
    MitHeartbeat {
        received_ack: bool,
        previous_nonce: Option<i64>,
    },
    /// UDP-Helfer laeuft, Endpunkt-Entdeckung bis Schluessel
    MitUdp {
        received_ack: bool,
        previous_nonce: Option<i64>,
        ssrc: u32,
        udp: UdpHelferHandle,
        ip_data: Option<(String, u16)>,
    },
}

/// Wie die aktive Phase endete
enum PhasenEnde {
    Logout,
    Restart { fresh: bool, wartezeit: Duration },
    Fatal(PalaverError),
}

// ---------------------------------------------------------------------------
// VoiceSitzung
// ---------------------------------------------------------------------------

/// Die Sitzungs-Zustandsmaschine
pub struct VoiceSitzung {
    daten: VoiceVerbindungsDaten,
    resume: ResumeDaten,
    voice_konfig: VoiceEinstellungen,
    protokolle: ProtokollEinstellungen,
    ereignisse: mpsc::Sender<VoiceEreignis>,
}

impl VoiceSitzung {
    /// Erstellt eine Sitzung; Resume-Daten kommen aus den
    /// Verbindungsdaten
    pub fn neu(
        daten: VoiceVerbindungsDaten,
        voice_konfig: VoiceEinstellungen,
        protokolle: ProtokollEinstellungen,
        ereignisse: mpsc::Sender<VoiceEreignis>,
    ) -> Self {
        let resume = daten.resume();
        Self {
            daten,
            resume,
            voice_konfig,
            protokolle,
            ereignisse,
        }
    }

    /// Erstellt eine Sitzung mit mitgebrachten Resume-Daten
    /// (Supervisor-Neustart)
    pub fn neu_mit_resume(
        daten: VoiceVerbindungsDaten,
        resume: ResumeDaten,
        voice_konfig: VoiceEinstellungen,
        protokolle: ProtokollEinstellungen,
        ereignisse: mpsc::Sender<VoiceEreignis>,
    ) -> Self {
        Self {
            daten,
            resume,
            voice_konfig,
            protokolle,
            ereignisse,
        }
    }

    /// Fuehrt die Sitzung aus bis Logout oder terminaler Fehler
    ///
    /// `sofort_login` ueberspringt das Warten auf das erste
    /// Login-Kommando (Supervisor-Neustart).
    pub async fn ausfuehren(
        mut self,
        kommandos: &mut mpsc::Receiver<VoiceKommando>,
        sofort_login: bool,
    ) -> SitzungsAusgang {
        let mut login_frist: Option<tokio::time::Instant> = if sofort_login {
            Some(tokio::time::Instant::now())
        } else {
            None
        };

        loop {
            // Phase Inaktiv: auf Login oder geplante Frist warten
            if login_frist.is_none() {
                match kommandos.recv().await {
                    Some(VoiceKommando::Login) => {}
                    Some(VoiceKommando::Logout) => {
                        return self.ausgang(Ok(()));
                    }
                    Some(andere) => {
                        tracing::warn!(kommando = ?andere, "Kommando im Zustand Inaktiv ignoriert");
                        continue;
                    }
                    None => return self.ausgang(Ok(())),
                }
            } else if let Some(frist) = login_frist.take() {
                tokio::select! {
                    _ = tokio::time::sleep_until(frist) => {}
                    kommando = kommandos.recv() => {
                        match kommando {
                            Some(VoiceKommando::Logout) | None => return self.ausgang(Ok(())),
                            Some(VoiceKommando::Login) => {}
                            Some(andere) => {
                                tracing::warn!(kommando = ?andere, "Kommando vor geplantem Login ignoriert");
                                login_frist = Some(frist);
                                continue;
                            }
                        }
                    }
                }
            }

            // Phase Aktiv
            match self.aktive_phase(kommandos).await {
                PhasenEnde::Logout => {
                    let _ = self.ereignisse.send(VoiceEreignis::Getrennt).await;
                    return self.ausgang(Ok(()));
                }
                PhasenEnde::Restart { fresh, wartezeit } => {
                    if fresh {
                        // Ohne Resume: Anmeldedaten der Verbindung verwenden
                        self.resume = self.daten.resume();
                    }
                    tracing::info!(
                        fresh,
                        wartezeit_ms = wartezeit.as_millis() as u64,
                        "Sitzung wird neu gestartet"
                    );
                    login_frist = Some(tokio::time::Instant::now() + wartezeit);
                }
                PhasenEnde::Fatal(fehler) => {
                    tracing::error!(fehler = %fehler, "Voice-Sitzung terminal beendet");
                    return self.ausgang(Err(fehler));
                }
            }
        }
    }

    fn ausgang(&self, ergebnis: Result<()>) -> SitzungsAusgang {
        SitzungsAusgang {
            ergebnis,
            resume: self.resume.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Aktive Phase
    // -----------------------------------------------------------------------

    /// Verbindet, sendet Identify und treibt die Ereignis-Schleife
    async fn aktive_phase(&mut self, kommandos: &mut mpsc::Receiver<VoiceKommando>) -> PhasenEnde {
        let url = self.daten.gateway_url();
        let ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                return PhasenEnde::Fatal(PalaverError::Transport(format!(
                    "Voice-Gateway {url}: {e}"
                )))
            }
        };
        tracing::info!(url = %url, "Voice-Gateway verbunden");
        let (mut sink, mut strom) = ws.split();

        // Identify gehoert als erstes in die Sende-Queue
        let identify = VoiceNachricht::Identify(IdentifyDaten {
            server_id: self.resume.server_id,
            user_id: self.daten.user_id,
            session_id: self.resume.session_id.clone(),
            token: self.resume.token.clone(),
        });
        if let Err(e) = self.senden(&mut sink, identify).await {
            return PhasenEnde::Fatal(e);
        }

        let mut detail = AktivDetail::MitQueue;
        let mut heartbeat: Option<tokio::time::Interval> = None;
        let mut udp_ereignisse: Option<mpsc::Receiver<UdpEreignis>> = None;

        loop {
            tokio::select! {
                rahmen = strom.next() => {
                    match rahmen {
                        Some(Ok(Message::Text(text))) => {
                            if self.protokolle.log_received_ws {
                                tracing::debug!(rahmen = %text, "WS-Frame empfangen");
                            }
                            let nachricht = match VoiceNachricht::dekodieren(&text) {
                                Ok(n) => n,
                                Err(e) => return PhasenEnde::Fatal(e),
                            };
                            if let Err(e) = self
                                .nachricht_verarbeiten(
                                    nachricht,
                                    &mut detail,
                                    &mut heartbeat,
                                    &mut udp_ereignisse,
                                )
                                .await
                            {
                                return PhasenEnde::Fatal(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return PhasenEnde::Fatal(PalaverError::Getrennt(
                                "Voice-Gateway hat die Verbindung geschlossen".to_string(),
                            ));
                        }
                        // Ping/Pong/Binary sind hier bedeutungslos
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return PhasenEnde::Fatal(PalaverError::Transport(e.to_string()));
                        }
                    }
                }

                _ = naechster_tick(&mut heartbeat) => {
                    if let Err(e) = self.heartbeat_senden(&mut sink, &mut detail).await {
                        return PhasenEnde::Fatal(e);
                    }
                }

                ereignis = udp_empfangen(&mut udp_ereignisse) => {
                    match ereignis {
                        UdpEreignis::IpGefunden { adresse, port } => {
                            if let Err(e) = self
                                .ip_gefunden(adresse, port, &mut sink, &mut detail)
                                .await
                            {
                                return PhasenEnde::Fatal(e);
                            }
                        }
                        UdpEreignis::Beendet => {
                            return PhasenEnde::Fatal(PalaverError::Protokoll(
                                "UDP-Helfer waehrend aktiver Sitzung beendet".to_string(),
                            ));
                        }
                    }
                }

                kommando = kommandos.recv() => {
                    match kommando {
                        Some(VoiceKommando::Logout) | None => {
                            // Queue abschliessen: Close senden, Helfer
                            // faellt mit dem Zustand
                            let _ = sink.send(Message::Close(None)).await;
                            return PhasenEnde::Logout;
                        }
                        Some(VoiceKommando::Restart { fresh, wartezeit }) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return PhasenEnde::Restart { fresh, wartezeit };
                        }
                        Some(VoiceKommando::SetzeSpeaking(spricht)) => {
                            if let AktivDetail::MitUdp { ssrc, .. } = &detail {
                                let nachricht = VoiceNachricht::Speaking(SpeakingDaten {
                                    speaking: spricht,
                                    delay: 0,
                                    ssrc: *ssrc,
                                });
                                if let Err(e) = self.senden(&mut sink, nachricht).await {
                                    return PhasenEnde::Fatal(e);
                                }
                            } else {
                                tracing::warn!("SetzeSpeaking vor fertigem Handshake ignoriert");
                            }
                        }
                        Some(VoiceKommando::Login) => {
                            tracing::warn!("Login-Kommando waehrend aktiver Sitzung ignoriert");
                        }
                    }
                }
            }
        }
    }

    /// Kodiert, loggt und sendet einen Frame
    async fn senden(&self, sink: &mut WsSink, nachricht: VoiceNachricht) -> Result<()> {
        let text = nachricht.kodieren()?;
        if self.protokolle.log_sent_ws {
            tracing::debug!(rahmen = %text, "WS-Frame gesendet");
        }
        sink.send(Message::Text(text))
            .await
            .map_err(|e| PalaverError::Transport(e.to_string()))
    }

    /// Zustandsuebergaenge fuer eingehende Gateway-Nachrichten
    async fn nachricht_verarbeiten(
        &self,
        nachricht: VoiceNachricht,
        detail: &mut AktivDetail,
        heartbeat: &mut Option<tokio::time::Interval>,
        udp_ereignisse: &mut Option<mpsc::Receiver<UdpEreignis>>,
    ) -> Result<()> {
        match nachricht {
            VoiceNachricht::Hello(hello) => match detail {
                AktivDetail::MitQueue => {
                    let intervall = Duration::from_millis(
                        hello.heartbeat_interval * HEARTBEAT_FAKTOR.0 / HEARTBEAT_FAKTOR.1,
                    );
                    let mut timer = tokio::time::interval_at(
                        tokio::time::Instant::now() + intervall,
                        intervall,
                    );
                    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    *heartbeat = Some(timer);
                    *detail = AktivDetail::MitHeartbeat {
                        received_ack: true,
                        previous_nonce: None,
                    };
                    tracing::debug!(
                        intervall_ms = intervall.as_millis() as u64,
                        "Hello empfangen, Heartbeat-Timer laeuft"
                    );
                    Ok(())
                }
                _ => Err(PalaverError::Protokoll(
                    "Hello ausserhalb des Handshakes".to_string(),
                )),
            },

            VoiceNachricht::Ready(ready) => match detail {
                AktivDetail::MitHeartbeat {
                    received_ack,
                    previous_nonce,
                } => {
                    let (udp, ereignisse) = UdpHelfer::starten(
                        &ready.ip,
                        ready.port,
                        ready.ssrc,
                        self.voice_konfig,
                    )
                    .await?;
                    udp.entdecke_ip().await;
                    *udp_ereignisse = Some(ereignisse);
                    *detail = AktivDetail::MitUdp {
                        received_ack: *received_ack,
                        previous_nonce: *previous_nonce,
                        ssrc: ready.ssrc,
                        udp,
                        ip_data: None,
                    };
                    let _ = self
                        .ereignisse
                        .send(VoiceEreignis::Verbunden { ssrc: ready.ssrc })
                        .await;
                    Ok(())
                }
                _ => Err(PalaverError::Protokoll(
                    "Ready ausserhalb des Handshakes".to_string(),
                )),
            },

            VoiceNachricht::HeartbeatAck { nonce } => match detail {
                AktivDetail::MitHeartbeat {
                    received_ack,
                    previous_nonce,
                }
                | AktivDetail::MitUdp {
                    received_ack,
                    previous_nonce,
                    ..
                } => {
                    if *previous_nonce == Some(nonce) {
                        *received_ack = true;
                        Ok(())
                    } else {
                        Err(PalaverError::Protokoll(format!(
                            "Heartbeat-ACK mit fremder Nonce: {nonce}"
                        )))
                    }
                }
                AktivDetail::MitQueue => Err(PalaverError::Protokoll(
                    "Heartbeat-ACK vor Hello".to_string(),
                )),
            },

            VoiceNachricht::SessionDescription(sd) => match detail {
                AktivDetail::MitUdp { udp, .. } => {
                    udp.start_connection(sd.secret_key).await;
                    let _ = self.ereignisse.send(VoiceEreignis::SitzungAktiv).await;
                    tracing::info!(modus = %sd.mode, "Sitzungsbeschreibung empfangen");
                    Ok(())
                }
                _ => Err(PalaverError::Protokoll(
                    "SessionDescription vor Ready".to_string(),
                )),
            },

            VoiceNachricht::Speaking(sprechen) => {
                let _ = self
                    .ereignisse
                    .send(VoiceEreignis::Spricht {
                        ssrc: sprechen.ssrc,
                        speaking: sprechen.speaking,
                    })
                    .await;
                Ok(())
            }

            VoiceNachricht::Ignoriert(op) => {
                tracing::trace!(op, "Ignorierte Gateway-Nachricht");
                Ok(())
            }

            // Client-seitige Nachrichten haben eingehend nichts verloren
            andere @ (VoiceNachricht::Identify(_)
            | VoiceNachricht::SelectProtocol(_)
            | VoiceNachricht::Heartbeat { .. }) => Err(PalaverError::Protokoll(format!(
                "Unerwartete Nachricht vom Gateway (op {})",
                andere.op()
            ))),
        }
    }

    /// Heartbeat-Tick: ohne frisches ACK terminal, sonst neue Nonce
    async fn heartbeat_senden(&self, sink: &mut WsSink, detail: &mut AktivDetail) -> Result<()> {
        match detail {
            AktivDetail::MitHeartbeat {
                received_ack,
                previous_nonce,
            }
            | AktivDetail::MitUdp {
                received_ack,
                previous_nonce,
                ..
            } => {
                if !*received_ack {
                    return Err(PalaverError::Protokoll(
                        "Heartbeat-ACK ausgeblieben".to_string(),
                    ));
                }
                let nonce = jetzt_epoch_millis();
                self.senden(sink, VoiceNachricht::Heartbeat { nonce }).await?;
                *received_ack = false;
                *previous_nonce = Some(nonce);
                Ok(())
            }
            // Timer existiert erst ab Hello
            AktivDetail::MitQueue => Ok(()),
        }
    }

    /// IP-Entdeckung abgeschlossen: Protokoll auswaehlen
    async fn ip_gefunden(
        &self,
        adresse: String,
        port: u16,
        sink: &mut WsSink,
        detail: &mut AktivDetail,
    ) -> Result<()> {
        match detail {
            AktivDetail::MitUdp { ip_data, .. } => {
                *ip_data = Some((adresse.clone(), port));
                let _ = self
                    .ereignisse
                    .send(VoiceEreignis::IpEntdeckt {
                        adresse: adresse.clone(),
                        port,
                    })
                    .await;
                self.senden(
                    sink,
                    VoiceNachricht::SelectProtocol(SelectProtocolDaten {
                        protocol: "udp".to_string(),
                        data: ProtokollDetails {
                            address: adresse,
                            port,
                            mode: MODUS_XSALSA20.to_string(),
                        },
                    }),
                )
                .await
            }
            _ => Err(PalaverError::Protokoll(
                "IP-Entdeckung ohne UDP-Helfer".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Select-Hilfen
// ---------------------------------------------------------------------------

/// Naechster Heartbeat-Tick; ohne Timer nie
async fn naechster_tick(intervall: &mut Option<tokio::time::Interval>) {
    match intervall {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Naechstes UDP-Ereignis; ohne Helfer nie
async fn udp_empfangen(ereignisse: &mut Option<mpsc::Receiver<UdpEreignis>>) -> UdpEreignis {
    match ereignisse {
        Some(rx) => match rx.recv().await {
            Some(ereignis) => ereignis,
            // Kanal zu ohne Beendet-Ereignis: gleichbedeutend
            None => UdpEreignis::Beendet,
        },
        None => std::future::pending().await,
    }
}

/// Aktuelle Zeit als Epoch-Millisekunden (Heartbeat-Nonce)
fn jetzt_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daten(adresse: &str) -> VoiceVerbindungsDaten {
        VoiceVerbindungsDaten {
            adresse: adresse.to_string(),
            version: 4,
            server_id: ServerId(1),
            user_id: UserId(2),
            session_id: SessionId("s".into()),
            token: "t".into(),
        }
    }

    #[test]
    fn gateway_url_standard_wss() {
        let d = daten("voice.example.net");
        assert_eq!(d.gateway_url(), "wss://voice.example.net?v=4");
    }

    #[test]
    fn gateway_url_uebernimmt_praefix() {
        let d = daten("ws://127.0.0.1:9000");
        assert_eq!(d.gateway_url(), "ws://127.0.0.1:9000?v=4");
    }

    #[test]
    fn resume_aus_verbindungsdaten() {
        let d = daten("voice.example.net");
        let r = d.resume();
        assert_eq!(r.server_id, ServerId(1));
        assert_eq!(r.session_id, SessionId("s".into()));
        assert_eq!(r.token, "t");
    }
}
