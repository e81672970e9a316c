use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

/// A remote "write this URL to the next tag" request. Owned by the backend;
/// the agent only reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    #[serde(rename = "_id")]
    pub id: String,
    /// Opaque reference; the backend may send an id or a populated document.
    #[serde(rename = "petId", default)]
    pub pet_id: Value,
    pub url: String,
    #[serde(default)]
    pub status: CommandStatus,
}

/// Body of `GET /api/nfc/commands/pending`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PendingCommandsResponse {
    #[serde(default)]
    pub data: Vec<PendingCommand>,
}
