//! Call-attempt identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one execution attempt of one shard of one workflow call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAttempt {
    /// Workflow instance the call belongs to.
    pub workflow_id: Uuid,
    /// Fully qualified call name.
    pub call: String,
    /// Scatter shard index, if the call is scattered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_index: Option<u32>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

impl CallAttempt {
    /// Creates the first attempt of an unsharded call.
    #[must_use]
    pub fn new(workflow_id: Uuid, call: impl Into<String>) -> Self {
        Self {
            workflow_id,
            call: call.into(),
            shard_index: None,
            attempt: 1,
        }
    }

    /// Sets the shard index.
    #[must_use]
    pub const fn with_shard(mut self, shard_index: u32) -> Self {
        self.shard_index = Some(shard_index);
        self
    }

    /// Sets the attempt number. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// The attempt that follows this one.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Shard rendering used in keys and tags; `-1` for unsharded calls.
    #[must_use]
    pub fn shard_label(&self) -> String {
        self.shard_index
            .map_or_else(|| "-1".to_string(), |s| s.to_string())
    }

    /// `workflow:call:shard:attempt` rendering for logs.
    #[must_use]
    pub fn tag(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.workflow_id,
            self.call,
            self.shard_label(),
            self.attempt
        )
    }
}

impl fmt::Display for CallAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}
