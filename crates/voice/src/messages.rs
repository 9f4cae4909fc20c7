//! Voice-Gateway-Protokoll (WebSocket)
//!
//! JSON-Frames der Form `{"op": <u8>, "d": <Payload>}`. Die Opcodes 12
//! (Video) und 13 (ClientDisconnect) werden ausdruecklich ignoriert;
//! alle anderen unbekannten Opcodes sind Protokollfehler.
//!
//! Heartbeat und HeartbeatACK tragen die Nonce direkt als Zahl in `d`,
//! alle anderen Nachrichten ein Objekt.

use palaver_core::{PalaverError, Result, ServerId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_IDENTIFY: u8 = 0;
pub const OP_SELECT_PROTOCOL: u8 = 1;
pub const OP_READY: u8 = 2;
pub const OP_HEARTBEAT: u8 = 3;
pub const OP_SESSION_DESCRIPTION: u8 = 4;
pub const OP_SPEAKING: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_HELLO: u8 = 8;
/// Video-Nachrichten – ignoriert
pub const OP_VIDEO: u8 = 12;
/// ClientDisconnect – ignoriert
pub const OP_CLIENT_DISCONNECT: u8 = 13;

/// Der einzige derzeit unterstuetzte Verschluesselungsmodus
pub const MODUS_XSALSA20: &str = "xsalsa20_poly1305";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Roh-Frame wie er auf der Leitung liegt
#[derive(Serialize, Deserialize)]
struct RohRahmen {
    op: u8,
    #[serde(default)]
    d: Value,
}

/// Anmeldung an der Voice-Sitzung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyDaten {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
}

/// Transport-Details der Protokollauswahl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtokollDetails {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// Auswahl des Transportprotokolls nach der IP-Entdeckung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolDaten {
    pub protocol: String,
    pub data: ProtokollDetails,
}

/// Antwort des Gateways auf Identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyDaten {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// Heartbeat-Parameter des Gateways
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloDaten {
    /// Heartbeat-Intervall in Millisekunden
    pub heartbeat_interval: u64,
}

/// Sitzungsschluessel nach der Protokollauswahl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptionDaten {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// Sprech-Status eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakingDaten {
    pub speaking: bool,
    pub delay: u32,
    pub ssrc: u32,
}

// ---------------------------------------------------------------------------
// VoiceNachricht
// ---------------------------------------------------------------------------

/// Typisierte Voice-Gateway-Nachricht
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceNachricht {
    Identify(IdentifyDaten),
    SelectProtocol(SelectProtocolDaten),
    Ready(ReadyDaten),
    Heartbeat { nonce: i64 },
    SessionDescription(SessionDescriptionDaten),
    Speaking(SpeakingDaten),
    HeartbeatAck { nonce: i64 },
    Hello(HelloDaten),
    /// Ausdruecklich ignorierter Opcode (12 oder 13)
    Ignoriert(u8),
}

impl VoiceNachricht {
    /// Der Opcode dieser Nachricht
    pub fn op(&self) -> u8 {
        match self {
            Self::Identify(_) => OP_IDENTIFY,
            Self::SelectProtocol(_) => OP_SELECT_PROTOCOL,
            Self::Ready(_) => OP_READY,
            Self::Heartbeat { .. } => OP_HEARTBEAT,
            Self::SessionDescription(_) => OP_SESSION_DESCRIPTION,
            Self::Speaking(_) => OP_SPEAKING,
            Self::HeartbeatAck { .. } => OP_HEARTBEAT_ACK,
            Self::Hello(_) => OP_HELLO,
            Self::Ignoriert(op) => *op,
        }
    }

    /// Serialisiert die Nachricht in einen JSON-Frame
    pub fn kodieren(&self) -> Result<String> {
        let d = match self {
            Self::Identify(daten) => serde_json::to_value(daten)?,
            Self::SelectProtocol(daten) => serde_json::to_value(daten)?,
            Self::Ready(daten) => serde_json::to_value(daten)?,
            Self::Heartbeat { nonce } => Value::from(*nonce),
            Self::SessionDescription(daten) => serde_json::to_value(daten)?,
            Self::Speaking(daten) => serde_json::to_value(daten)?,
            Self::HeartbeatAck { nonce } => Value::from(*nonce),
            Self::Hello(daten) => serde_json::to_value(daten)?,
            Self::Ignoriert(_) => Value::Null,
        };
        Ok(serde_json::to_string(&RohRahmen { op: self.op(), d })?)
    }

    /// Deserialisiert einen JSON-Frame
    ///
    /// # Fehler
    /// - `Dekodierung` bei ungueltigem JSON oder falschem Payload
    /// - `UngueltigeNachricht` bei unbekanntem Opcode oder fehlender Nonce
    pub fn dekodieren(text: &str) -> Result<Self> {
        let roh: RohRahmen = serde_json::from_str(text)?;
        match roh.op {
            OP_IDENTIFY => Ok(Self::Identify(serde_json::from_value(roh.d)?)),
            OP_SELECT_PROTOCOL => Ok(Self::SelectProtocol(serde_json::from_value(roh.d)?)),
            OP_READY => Ok(Self::Ready(serde_json::from_value(roh.d)?)),
            OP_HEARTBEAT => Ok(Self::Heartbeat {
                nonce: nonce_aus(&roh.d)?,
            }),
            OP_SESSION_DESCRIPTION => {
                Ok(Self::SessionDescription(serde_json::from_value(roh.d)?))
            }
            OP_SPEAKING => Ok(Self::Speaking(serde_json::from_value(roh.d)?)),
            OP_HEARTBEAT_ACK => Ok(Self::HeartbeatAck {
                nonce: nonce_aus(&roh.d)?,
            }),
            OP_HELLO => Ok(Self::Hello(serde_json::from_value(roh.d)?)),
            OP_VIDEO | OP_CLIENT_DISCONNECT => Ok(Self::Ignoriert(roh.op)),
            unbekannt => Err(PalaverError::UngueltigeNachricht(format!(
                "Unbekannter Voice-Opcode: {unbekannt}"
            ))),
        }
    }
}

/// Liest die Nonce aus dem `d`-Feld eines Heartbeat-Frames
fn nonce_aus(d: &Value) -> Result<i64> {
    d.as_i64().ok_or_else(|| {
        PalaverError::UngueltigeNachricht("Heartbeat ohne numerische Nonce".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify() -> VoiceNachricht {
        VoiceNachricht::Identify(IdentifyDaten {
            server_id: ServerId(42),
            user_id: UserId(7),
            session_id: SessionId("sitzung-abc".into()),
            token: "geheim".into(),
        })
    }

    #[test]
    fn identify_round_trip() {
        let kodiert = identify().kodieren().unwrap();
        assert!(kodiert.contains("\"op\":0"));
        let dekodiert = VoiceNachricht::dekodieren(&kodiert).unwrap();
        assert_eq!(dekodiert, identify());
    }

    #[test]
    fn heartbeat_nonce_liegt_direkt_in_d() {
        let kodiert = VoiceNachricht::Heartbeat { nonce: 1234567 }.kodieren().unwrap();
        let roh: serde_json::Value = serde_json::from_str(&kodiert).unwrap();
        assert_eq!(roh["op"], 3);
        assert_eq!(roh["d"], 1234567);

        let zurueck = VoiceNachricht::dekodieren(&kodiert).unwrap();
        assert_eq!(zurueck, VoiceNachricht::Heartbeat { nonce: 1234567 });
    }

    #[test]
    fn heartbeat_ack_round_trip() {
        let kodiert = VoiceNachricht::HeartbeatAck { nonce: -5 }.kodieren().unwrap();
        let zurueck = VoiceNachricht::dekodieren(&kodiert).unwrap();
        assert_eq!(zurueck, VoiceNachricht::HeartbeatAck { nonce: -5 });
    }

    #[test]
    fn hello_und_ready_round_trip() {
        let hello = VoiceNachricht::Hello(HelloDaten {
            heartbeat_interval: 41250,
        });
        let zurueck = VoiceNachricht::dekodieren(&hello.kodieren().unwrap()).unwrap();
        assert_eq!(zurueck, hello);

        let ready = VoiceNachricht::Ready(ReadyDaten {
            ssrc: 7,
            ip: "203.0.113.9".into(),
            port: 5000,
            modes: vec![MODUS_XSALSA20.into()],
        });
        let zurueck = VoiceNachricht::dekodieren(&ready.kodieren().unwrap()).unwrap();
        assert_eq!(zurueck, ready);
    }

    #[test]
    fn select_protocol_traegt_modus() {
        let nachricht = VoiceNachricht::SelectProtocol(SelectProtocolDaten {
            protocol: "udp".into(),
            data: ProtokollDetails {
                address: "1.2.3.4".into(),
                port: 60000,
                mode: MODUS_XSALSA20.into(),
            },
        });
        let kodiert = nachricht.kodieren().unwrap();
        assert!(kodiert.contains("xsalsa20_poly1305"));
        assert_eq!(VoiceNachricht::dekodieren(&kodiert).unwrap(), nachricht);
    }

    #[test]
    fn ignorierte_opcodes() {
        let video = VoiceNachricht::dekodieren(r#"{"op":12,"d":{"egal":true}}"#).unwrap();
        assert_eq!(video, VoiceNachricht::Ignoriert(12));

        let disconnect = VoiceNachricht::dekodieren(r#"{"op":13,"d":{"user_id":1}}"#).unwrap();
        assert_eq!(disconnect, VoiceNachricht::Ignoriert(13));
    }

    #[test]
    fn unbekannter_opcode_ist_fehler() {
        let ergebnis = VoiceNachricht::dekodieren(r#"{"op":99,"d":null}"#);
        assert!(matches!(
            ergebnis,
            Err(PalaverError::UngueltigeNachricht(_))
        ));
    }

    #[test]
    fn heartbeat_ohne_nonce_ist_fehler() {
        let ergebnis = VoiceNachricht::dekodieren(r#"{"op":3,"d":{"nonce":1}}"#);
        assert!(ergebnis.is_err());
    }

    #[test]
    fn fehlendes_d_wird_null() {
        // Ignorierte Opcodes duerfen ohne d kommen
        let ergebnis = VoiceNachricht::dekodieren(r#"{"op":12}"#).unwrap();
        assert_eq!(ergebnis, VoiceNachricht::Ignoriert(12));
    }

    #[test]
    fn session_description_schluessel_als_bytes() {
        let nachricht = VoiceNachricht::SessionDescription(SessionDescriptionDaten {
            mode: MODUS_XSALSA20.into(),
            secret_key: vec![1, 2, 3, 255],
        });
        let kodiert = nachricht.kodieren().unwrap();
        assert!(kodiert.contains("[1,2,3,255]"));
        assert_eq!(VoiceNachricht::dekodieren(&kodiert).unwrap(), nachricht);
    }
}
