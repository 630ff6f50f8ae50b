//! Agent presence tracking.
//!
//! An activity marks an agent as live inside a collective. It is keyed by
//! `(collective_id, agent_id)` rather than a UUID: each agent has at most
//! one presence row per collective, refreshed by heartbeats and aged out by
//! the stale threshold.

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, ValidationError};
use crate::types::{AgentId, CollectiveId, Timestamp};

/// Maximum agent id length in bytes for activity rows.
pub const MAX_ACTIVITY_AGENT_ID_LENGTH: usize = 255;

/// Maximum size of `current_task` and `context_summary` in bytes (1 KiB).
pub const MAX_ACTIVITY_FIELD_SIZE: usize = 1024;

/// A stored presence row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activity {
    /// The agent this row belongs to.
    pub agent_id: AgentId,

    /// The collective the agent is operating in.
    pub collective_id: CollectiveId,

    /// What the agent is currently working on.
    pub current_task: Option<String>,

    /// Short summary of the agent's working context.
    pub context_summary: Option<String>,

    /// When the activity was first registered.
    pub started_at: Timestamp,

    /// When the agent last checked in.
    pub last_heartbeat: Timestamp,
}

impl Activity {
    /// True if the last heartbeat is within `threshold_ms` of `now`.
    pub fn is_live(&self, now: Timestamp, threshold_ms: u64) -> bool {
        now.millis_since(self.last_heartbeat) as u64 <= threshold_ms
    }
}

/// Input for [`register_activity`](crate::PulseDb::register_activity).
///
/// Registering twice for the same `(collective, agent)` pair replaces the
/// previous row (upsert).
#[derive(Clone, Debug)]
pub struct NewActivity {
    /// The registering agent.
    pub agent_id: AgentId,

    /// Target collective.
    pub collective_id: CollectiveId,

    /// What the agent is working on (≤ 1 KiB).
    pub current_task: Option<String>,

    /// Context summary (≤ 1 KiB).
    pub context_summary: Option<String>,
}

pub(crate) fn validate_new_activity(activity: &NewActivity) -> Result<(), PulseError> {
    if activity.agent_id.as_str().is_empty() {
        return Err(ValidationError::required_field("agent_id").into());
    }
    if activity.agent_id.as_str().len() > MAX_ACTIVITY_AGENT_ID_LENGTH {
        return Err(ValidationError::invalid_field(
            "agent_id",
            format!(
                "exceeds max length of {MAX_ACTIVITY_AGENT_ID_LENGTH} bytes (got {})",
                activity.agent_id.as_str().len()
            ),
        )
        .into());
    }
    if let Some(ref task) = activity.current_task {
        if task.len() > MAX_ACTIVITY_FIELD_SIZE {
            return Err(
                ValidationError::content_too_large(task.len(), MAX_ACTIVITY_FIELD_SIZE).into(),
            );
        }
    }
    if let Some(ref summary) = activity.context_summary {
        if summary.len() > MAX_ACTIVITY_FIELD_SIZE {
            return Err(
                ValidationError::content_too_large(summary.len(), MAX_ACTIVITY_FIELD_SIZE).into(),
            );
        }
    }
    Ok(())
}
