use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, kinds};

/// Messages the hardware worker writes to its stdout, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// The reader driver initialised; the worker is listening.
    #[serde(rename = "ready")]
    Ready,
    /// Driver initialisation failed. The worker exits right after sending this.
    #[serde(rename = "init-failed")]
    InitFailed { data: String },
    #[serde(rename = "reader:connect", alias = "reader")]
    ReaderConnect { name: String },
    #[serde(rename = "reader:disconnect")]
    ReaderDisconnect { name: String },
    #[serde(rename = "card")]
    Card { reader: String, uid: String, atr: String },
    #[serde(rename = "card:remove")]
    CardRemove { reader: String, uid: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "write:progress")]
    WriteProgress(WriteProgress),
    #[serde(rename = "card:write-complete")]
    WriteComplete(WriteResult),
}

impl WorkerMessage {
    /// Wrap this message into a backend [`Event`].
    ///
    /// `ready` is purely a lifecycle signal and yields `None`. `init-failed`
    /// is reported as an `error` event so the operator sees driver problems.
    pub fn to_event(&self) -> Option<Event> {
        match self {
            Self::Ready => None,
            Self::InitFailed { data } => Some(Event::new(
                kinds::ERROR,
                serde_json::json!({ "message": data, "stage": "init" }),
            )),
            other => {
                let mut data = serde_json::to_value(other).unwrap_or(Value::Null);
                let kind = match data.as_object_mut().and_then(|map| map.remove("type")) {
                    Some(Value::String(kind)) => kind,
                    _ => return None,
                };
                Some(Event::new(kind, data))
            }
        }
    }
}

/// Messages the supervisor writes to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SupervisorMessage {
    /// Intercept the next tag presentation and write `url` to it.
    #[serde(rename = "write-request")]
    WriteRequest { url: String },
    #[serde(rename = "terminate")]
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteProgress {
    pub uid: String,
    /// Tag page that was just written.
    pub page: u8,
    /// Pages written so far, including `page`.
    pub written: usize,
    pub total: usize,
}

/// Outcome of one write attempt. Doubles as the body of
/// `POST /api/nfc/commands/:id/result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub uid: String,
    pub write_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WriteResult {
    pub fn success(uid: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            write_success: true,
            url: Some(url.into()),
            message: None,
        }
    }

    pub fn failure(uid: impl Into<String>, url: Option<String>, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            write_success: false,
            url,
            message: Some(message.into()),
        }
    }
}

/// Serialize one channel message as a single line (no trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}
