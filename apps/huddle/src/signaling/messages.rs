use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames this endpoint sends to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Identify { token: String, uuid: String },
    Ping,
    RequestOffer { to: String },
    AssertControl,
    Signal { to: String, data: Value },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Identify { .. } => "identify",
            ClientMessage::Ping => "ping",
            ClientMessage::RequestOffer { .. } => "request_offer",
            ClientMessage::AssertControl => "assert_control",
            ClientMessage::Signal { .. } => "signal",
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames the rendezvous service sends to this endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pong,
    Signal { from: String, data: Value },
    RequestOffer { from: String },
    Reload,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct SignalPayload {
    from: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RequestOfferPayload {
    from: String,
}

impl ServerMessage {
    /// Decodes one inbound text frame.
    ///
    /// Unknown events decode to `Ok(None)`; payloads that are not JSON or miss
    /// required fields are errors. `pong` and `reload` ignore their payload.
    pub fn parse(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let message = match envelope.event.as_str() {
            "pong" => ServerMessage::Pong,
            "reload" => ServerMessage::Reload,
            "signal" => {
                let payload: SignalPayload = serde_json::from_value(envelope.data)?;
                ServerMessage::Signal {
                    from: payload.from,
                    data: payload.data,
                }
            }
            "request_offer" => {
                let payload: RequestOfferPayload = serde_json::from_value(envelope.data)?;
                ServerMessage::RequestOffer { from: payload.from }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Which peer-directed notification a [`PeerMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Signal,
    RequestOffer,
}

/// Payload of the channel's `message` event.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    pub event: SignalKind,
    pub from: String,
    pub data: Value,
}
