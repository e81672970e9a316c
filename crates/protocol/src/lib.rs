//! Wire types shared by the agent process and the hardware worker.
//!
//! Three vocabularies live here:
//!
//! - [`Event`]: what the agent reports to the backend (`POST /api/nfc/events`).
//! - [`WorkerMessage`] / [`SupervisorMessage`]: the newline-delimited JSON
//!   exchanged with the isolated worker process over its stdio.
//! - [`PendingCommand`] / [`WriteResult`]: remote write commands and their
//!   reported outcome.

mod backend;
mod event;
mod worker;

pub use backend::{CommandStatus, PendingCommand, PendingCommandsResponse};
pub use event::{Event, kinds};
pub use worker::{SupervisorMessage, WorkerMessage, WriteProgress, WriteResult, decode_line, encode_line};
