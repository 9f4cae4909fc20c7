//! UDP-Helfer – Endpunkt-Entdeckung und Paket-Queue
//!
//! Ein eigener Task besitzt den UDP-Socket zur Voice-Gegenstelle.
//! Die Sitzungs-Zustandsmaschine spricht ihn ueber Kommandos an und
//! erhaelt Ereignisse zurueck:
//!
//! - `EntdeckeIp`: 70-Byte-Entdeckungspaket mit der SSRC senden; die
//!   Gegenstelle antwortet mit der von aussen sichtbaren Adresse und
//!   dem Port -> `IpGefunden`
//! - `StartConnection`: Sitzungsschluessel uebernehmen; erst danach
//!   verlassen Pakete die Queue
//! - Paket-Queue: begrenzt durch `max_packets_before_drop`, entleert
//!   in Bursts von `max_burst_amount`, hoechstens
//!   `send_request_amount` Pakete pro Weckzyklus
//!
//! Endet der Task, geht ein `Beendet`-Ereignis an die Sitzung; waehrend
//! einer aktiven Sitzung ist das ein terminaler Fehler.

use palaver_core::config::VoiceEinstellungen;
use palaver_core::{PalaverError, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Groesse des Entdeckungspakets: 4 Bytes SSRC (big-endian), 64 Bytes
/// Adresse (NUL-terminiert), 2 Bytes Port (big-endian)
pub const ENTDECKUNG_PAKET_GROESSE: usize = 70;

/// Empfangspuffer-Groesse
const UDP_PUFFER_GROESSE: usize = 1500;

// ---------------------------------------------------------------------------
// Kommandos und Ereignisse
// ---------------------------------------------------------------------------

/// Kommandos an den Helfer-Task
#[derive(Debug)]
pub enum UdpKommando {
    /// Entdeckungspaket senden und auf die Antwort warten
    EntdeckeIp,
    /// Sitzungsschluessel uebernehmen; schaltet den Paketversand frei
    StartConnection { secret_key: Vec<u8> },
}

/// Ereignisse des Helfer-Tasks
#[derive(Debug, PartialEq, Eq)]
pub enum UdpEreignis {
    /// Die Gegenstelle hat unsere externe Adresse mitgeteilt
    IpGefunden { adresse: String, port: u16 },
    /// Der Helfer-Task ist beendet
    Beendet,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle auf den Helfer-Task
///
/// Beim Drop des Handles schliessen die Kanaele und der Task endet.
#[derive(Debug)]
pub struct UdpHelferHandle {
    kommandos: mpsc::Sender<UdpKommando>,
    pakete: mpsc::Sender<Vec<u8>>,
}

impl UdpHelferHandle {
    /// Stoesst die IP-Entdeckung an
    pub async fn entdecke_ip(&self) {
        let _ = self.kommandos.send(UdpKommando::EntdeckeIp).await;
    }

    /// Uebergibt den Sitzungsschluessel und schaltet den Versand frei
    pub async fn start_connection(&self, secret_key: Vec<u8>) {
        let _ = self
            .kommandos
            .send(UdpKommando::StartConnection { secret_key })
            .await;
    }

    /// Reiht ein Paket ein; bei voller Queue wird es verworfen
    ///
    /// Gibt `false` zurueck wenn das Paket nicht angenommen wurde.
    pub fn sende_paket(&self, daten: Vec<u8>) -> bool {
        self.pakete.try_send(daten).is_ok()
    }
}

// ---------------------------------------------------------------------------
// UdpHelfer
// ---------------------------------------------------------------------------

/// Fabrik fuer den Helfer-Task
pub struct UdpHelfer;

impl UdpHelfer {
    /// Bindet einen Socket, verbindet ihn mit der Gegenstelle und
    /// startet den Helfer-Task
    pub async fn starten(
        adresse: &str,
        port: u16,
        ssrc: u32,
        konfig: VoiceEinstellungen,
    ) -> Result<(UdpHelferHandle, mpsc::Receiver<UdpEreignis>)> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| PalaverError::Transport(format!("UDP-Socket: {e}")))?;
        socket
            .connect((adresse, port))
            .await
            .map_err(|e| PalaverError::Transport(format!("UDP-Connect {adresse}:{port}: {e}")))?;

        tracing::debug!(ziel = %format!("{adresse}:{port}"), ssrc, "UDP-Helfer gestartet");

        let (kommando_tx, kommando_rx) = mpsc::channel(16);
        let (paket_tx, paket_rx) = mpsc::channel(konfig.max_packets_before_drop.max(1));
        let (ereignis_tx, ereignis_rx) = mpsc::channel(16);

        tokio::spawn(helfer_task(
            socket,
            ssrc,
            konfig,
            kommando_rx,
            paket_rx,
            ereignis_tx,
        ));

        Ok((
            UdpHelferHandle {
                kommandos: kommando_tx,
                pakete: paket_tx,
            },
            ereignis_rx,
        ))
    }
}

/// Baut das 70-Byte-Entdeckungspaket
fn entdeckungspaket(ssrc: u32) -> [u8; ENTDECKUNG_PAKET_GROESSE] {
    let mut paket = [0u8; ENTDECKUNG_PAKET_GROESSE];
    paket[0..4].copy_from_slice(&ssrc.to_be_bytes());
    paket
}

/// Liest Adresse und Port aus einer Entdeckungs-Antwort
fn entdeckung_parsen(daten: &[u8], erwartete_ssrc: u32) -> Option<(String, u16)> {
    if daten.len() < ENTDECKUNG_PAKET_GROESSE {
        return None;
    }
    let ssrc = u32::from_be_bytes([daten[0], daten[1], daten[2], daten[3]]);
    if ssrc != erwartete_ssrc {
        return None;
    }
    let adress_bytes = &daten[4..68];
    let ende = adress_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(adress_bytes.len());
    let adresse = String::from_utf8_lossy(&adress_bytes[..ende]).into_owned();
    let port = u16::from_be_bytes([daten[68], daten[69]]);
    Some((adresse, port))
}

/// Der eigentliche Helfer-Task: Besitzer des Sockets
async fn helfer_task(
    socket: UdpSocket,
    ssrc: u32,
    konfig: VoiceEinstellungen,
    mut kommandos: mpsc::Receiver<UdpKommando>,
    mut pakete: mpsc::Receiver<Vec<u8>>,
    ereignisse: mpsc::Sender<UdpEreignis>,
) {
    let mut puffer = [0u8; UDP_PUFFER_GROESSE];
    let mut secret_key: Option<Vec<u8>> = None;
    let mut erwarte_entdeckung = false;

    loop {
        tokio::select! {
            kommando = kommandos.recv() => {
                match kommando {
                    Some(UdpKommando::EntdeckeIp) => {
                        if let Err(e) = socket.send(&entdeckungspaket(ssrc)).await {
                            tracing::error!(fehler = %e, "Entdeckungspaket-Senden fehlgeschlagen");
                            break;
                        }
                        erwarte_entdeckung = true;
                        tracing::debug!(ssrc, "IP-Entdeckung angestossen");
                    }
                    Some(UdpKommando::StartConnection { secret_key: schluessel }) => {
                        tracing::info!(
                            schluessel_bytes = schluessel.len(),
                            "Sitzungsschluessel uebernommen, Paketversand frei"
                        );
                        secret_key = Some(schluessel);
                    }
                    // Handle gedroppt
                    None => break,
                }
            }

            paket = pakete.recv() => {
                match paket {
                    Some(daten) => {
                        if secret_key.is_none() {
                            tracing::warn!("Paket vor StartConnection verworfen");
                            continue;
                        }
                        burst_senden(&socket, daten, &mut pakete, &konfig).await;
                    }
                    None => break,
                }
            }

            empfangen = socket.recv(&mut puffer), if erwarte_entdeckung => {
                match empfangen {
                    Ok(laenge) => {
                        if let Some((adresse, port)) = entdeckung_parsen(&puffer[..laenge], ssrc) {
                            erwarte_entdeckung = false;
                            tracing::info!(adresse = %adresse, port, "Externe Adresse entdeckt");
                            if ereignisse
                                .send(UdpEreignis::IpGefunden { adresse, port })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            tracing::debug!(laenge, "Unerwartetes UDP-Paket verworfen");
                        }
                    }
                    Err(e) => {
                        tracing::error!(fehler = %e, "UDP-Empfangsfehler");
                        break;
                    }
                }
            }
        }
    }

    // Die Sitzung entscheidet ob das terminal ist
    let _ = ereignisse.send(UdpEreignis::Beendet).await;
    tracing::debug!("UDP-Helfer beendet");
}

/// Entleert die Paket-Queue in Bursts
///
/// Hoechstens `send_request_amount` Pakete pro Aufruf; nach jeweils
/// `max_burst_amount` Paketen gibt der Task den Scheduler frei.
async fn burst_senden(
    socket: &UdpSocket,
    erstes: Vec<u8>,
    pakete: &mut mpsc::Receiver<Vec<u8>>,
    konfig: &VoiceEinstellungen,
) {
    let mut gesendet = 0usize;
    let mut naechstes = Some(erstes);

    while let Some(daten) = naechstes.take() {
        if let Err(e) = socket.send(&daten).await {
            tracing::warn!(fehler = %e, "UDP-Sendefehler");
            return;
        }
        gesendet += 1;
        if gesendet >= konfig.send_request_amount.max(1) {
            break;
        }
        if gesendet % konfig.max_burst_amount.max(1) == 0 {
            tokio::task::yield_now().await;
        }
        naechstes = pakete.try_recv().ok();
    }
    tracing::trace!(gesendet, "Paket-Burst gesendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
