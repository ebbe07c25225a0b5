use serde::{Deserialize, Serialize};

/// Progress events for one batch run, broadcast to SSE subscribers and the
/// CLI progress bar. `Progress` fires after a task is dispatched, before its
/// result is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: String, total: u64 },
    Progress { run_id: String, dispatched: u64, total: u64 },
    ResultReady { run_id: String, result_id: String, ratio: String, seq: u64 },
    Finished { run_id: String, produced: u64 },
    Failed { run_id: String, error: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Progress { run_id, .. }
            | RunEvent::ResultReady { run_id, .. }
            | RunEvent::Finished { run_id, .. }
            | RunEvent::Failed { run_id, .. } => run_id,
        }
    }
}
