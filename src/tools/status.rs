//! Conversation status signaling tool
//!
//! Lets the model assert conversation state out-of-band from the
//! user-visible reply. No external side effect: the invocation record in
//! the interaction log *is* the signal the resolver reads.

use serde_json::{json, Value};

use super::{ParamKind, ParameterSpec, ToolDescriptor, ToolGroup, ToolOutcome};
use crate::status::{ConversationStatus, UPDATE_STATUS_TOOL};

pub struct StatusTools {
    descriptors: Vec<ToolDescriptor>,
}

impl StatusTools {
    pub fn new() -> Self {
        let allowed: Vec<String> = ConversationStatus::ALL
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        Self {
            descriptors: vec![ToolDescriptor::new(
                UPDATE_STATUS_TOOL,
                "Update the current conversation status (internal only; never display status codes to the user).",
                vec![ParameterSpec::required(
                    "status",
                    ParamKind::String,
                    "The conversation status code to set.",
                )
                .with_allowed(allowed)],
            )],
        }
    }
}

impl Default for StatusTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolGroup for StatusTools {
    fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    async fn call(&self, _name: &str, arguments: &Value) -> ToolOutcome {
        let status = arguments
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if status.is_empty() {
            return ToolOutcome::error("Missing status");
        }

        // Labels outside the known set pass through unchanged: newer models
        // may signal states this build does not know yet.
        ToolOutcome::Ok(json!({ "status": status, "updated": true }))
    }
}
