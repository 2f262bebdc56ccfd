//! Control Channel: commands posted by pages to the worker.
//!
//! Wire format is a JSON object tagged by `type`:
//!
//! ```text
//! { "type": "GENERATE_NUMBER", "limite": "50" }   → { "numero": 17.3 }
//! { "type": "SKIP_WAITING" }
//! ```
//!
//! Unknown or malformed messages are dropped without a reply.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::clients::ClientRegistry;
use crate::config::WorkerConfig;

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "GENERATE_NUMBER")]
    GenerateNumber {
        #[serde(default)]
        limite: Option<Value>,
    },

    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Decode a raw message. `None` if it is not an object with a string `type`.
    pub fn parse(data: &Value) -> Option<Self> {
        let kind = data.as_object()?.get("type")?.as_str()?;
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(kind, error = %e, "Undecodable control message");
                None
            }
        }
    }
}

/// One end of a reply channel handed over with a message.
#[derive(Debug, Clone)]
pub struct ReplyPort {
    tx: mpsc::UnboundedSender<Value>,
}

impl ReplyPort {
    /// Create a port and the receiver the sender keeps.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post a message. Returns false if the other end is gone.
    pub fn post(&self, message: Value) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// A message as delivered by the host.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Value,
    pub port: Option<ReplyPort>,
}

impl MessageEvent {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            port: None,
        }
    }

    pub fn with_port(mut self, port: ReplyPort) -> Self {
        self.port = Some(port);
        self
    }
}

/// What handling a message did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlOutcome {
    /// Number sent through the reply port.
    Replied { numero: f64 },
    /// Number broadcast to this many clients.
    Broadcast { numero: f64, delivered: usize },
    /// The worker should stop waiting and activate.
    SkipWaiting,
    /// Unknown or malformed; nothing happened.
    Ignored,
}

/// Leading integer of a `parseInt`-style string: optional sign, then digits.
fn leading_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let magnitude = rest[..digits].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

/// Resolve the `limite` field. Missing, non-numeric and non-positive values
/// all give `default`.
pub fn parse_limit(limite: Option<&Value>, default: u32) -> u32 {
    let parsed = match limite {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => leading_integer(s),
        _ => None,
    };

    match parsed {
        Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
        _ => default,
    }
}

/// Uniform number in `[0, limit)`.
pub fn generate_number(limit: u32) -> f64 {
    rand::thread_rng().gen_range(0.0..f64::from(limit.max(1)))
}

/// Dispatches control messages.
pub struct ControlChannel {
    config: Arc<WorkerConfig>,
    clients: Arc<ClientRegistry>,
}

impl ControlChannel {
    pub fn new(config: Arc<WorkerConfig>, clients: Arc<ClientRegistry>) -> Self {
        Self { config, clients }
    }

    pub async fn handle(&self, event: MessageEvent) -> ControlOutcome {
        let Some(message) = ControlMessage::parse(&event.data) else {
            debug!(data = %event.data, "Ignoring malformed control message");
            return ControlOutcome::Ignored;
        };

        match message {
            ControlMessage::GenerateNumber { limite } => {
                let limit = parse_limit(limite.as_ref(), self.config.default_random_limit);
                let numero = generate_number(limit);
                debug!(limit, numero, "Generated number");
                self.deliver(numero, event.port).await
            }
            ControlMessage::SkipWaiting => ControlOutcome::SkipWaiting,
            ControlMessage::Unknown => {
                debug!(data = %event.data, "Ignoring unknown control message");
                ControlOutcome::Ignored
            }
        }
    }

    async fn deliver(&self, numero: f64, port: Option<ReplyPort>) -> ControlOutcome {
        let payload = json!({ "numero": numero });
        match port {
            Some(port) => {
                if !port.post(payload) {
                    trace!("Reply port closed, dropping reply");
                }
                ControlOutcome::Replied { numero }
            }
            None => {
                let delivered = self.clients.broadcast(&payload).await;
                ControlOutcome::Broadcast { numero, delivered }
            }
        }
    }
}
