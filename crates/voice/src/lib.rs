//! palaver-voice – Voice-Session-Zustandsmaschine
//!
//! Dieser Crate haelt eine persistente WebSocket-Sitzung zum
//! Voice-Gateway: Identify/Hello/Heartbeat-Handshake, UDP-Endpunkt-
//! Entdeckung ueber einen Helfer-Task, Protokollauswahl und laufende
//! Heartbeats mit Quittungs-Verfolgung.
//!
//! ## Architektur
//!
//! ```text
//! Supervisor (Neustart-Schleife mit Resume-Daten)
//!     |
//!     v
//! VoiceSitzung (ein Task, eine Ereignis-Schleife)
//!     |  Inaktiv -> Aktiv(MitQueue) -> Aktiv(MitHeartbeat) -> Aktiv(MitUdp)
//!     |
//!     +-- WebSocket (tokio-tungstenite, JSON-Frames {op, d})
//!     +-- Heartbeat-Timer (0.75 x Intervall, Nonce-Abgleich)
//!     +-- UdpHelfer (eigener Task: IP-Entdeckung, Paket-Queue)
//! ```
//!
//! Protokollverletzungen (unbekannte Nonce, ausgebliebenes ACK, Tod
//! des UDP-Helfers) sind terminal; der Supervisor erstellt die Sitzung
//! nach einer Wartezeit mit den Resume-Daten neu.

pub mod messages;
pub mod session;
pub mod supervisor;
pub mod udp;

// Bequeme Re-Exporte
pub use messages::VoiceNachricht;
pub use session::{
    ResumeDaten, SitzungsAusgang, VoiceEreignis, VoiceKommando, VoiceSitzung,
    VoiceVerbindungsDaten,
};
pub use supervisor::ueberwacht_ausfuehren;
pub use udp::{UdpEreignis, UdpHelfer, UdpHelferHandle};
