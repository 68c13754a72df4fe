//! `/ws` message discriminators (spec §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client messages observed on `/ws`. Tagged by `type` so the
/// wire shape needs no translation on the client side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Version(Value),
    Query(Value),
    UsageUpdate(Value),
    JobUpdate(Value),
    DaemonStatus(Value),
    LlmStream(Value),
    PulseExecutionStarted(Value),
    PulseExecutionFailed(Value),
    PulseExecutionCompleted(Value),
    PulseExecutionLogStream(Value),
    StorageWarning(Value),
    StorageEviction(Value),
    PluginHealth(Value),
    WatcherMatch(Value),
    WatcherError(Value),
    GlyphFired(Value),
    SyncStatus(Value),
}

/// Client → server messages observed on `/ws` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Query(Value),
    Clear(Value),
    Ping(Value),
    SetVerbosity(Value),
    SetGraphLimit(Value),
    Upload(Value),
    DaemonControl(Value),
    PulseConfigUpdate(Value),
    JobControl(Value),
    Visibility(Value),
    VidstreamInit(Value),
    VidstreamFrame(Value),
    RichSearch(Value),
    WatcherUpsert(Value),
}
