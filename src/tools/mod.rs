//! Tool descriptors, outcome envelopes, and the dispatch registry
//!
//! Tools are the only operations the model may request. Dispatch never
//! raises past this boundary: unknown names, bad arguments, and provider
//! failures all become data-level error envelopes the orchestrator can
//! feed back to the model as a normal tool result.

pub mod status;
pub mod vaulta;

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

//
// ================= Descriptors =================
//

/// JSON types a tool parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn as_schema_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    /// Enum constraint, rendered into the schema for the model. Membership
    /// is left to the backing tool so unknown-but-plausible values can pass
    /// through (the signaling tool depends on this).
    pub allowed: Option<Vec<String>>,
}

impl ParameterSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            allowed: None,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
            allowed: None,
        }
    }

    pub fn with_allowed(mut self, values: Vec<String>) -> Self {
        self.allowed = Some(values);
        self
    }
}

/// Static description of a callable tool. Built once at registry
/// construction, never mutated at runtime.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParameterSpec>,
}

impl ToolDescriptor {
    pub fn new(
        name: &'static str,
        description: &'static str,
        params: Vec<ParameterSpec>,
    ) -> Self {
        Self {
            name,
            description,
            params,
        }
    }

    /// Render the JSON-Schema object sent to the model and served by
    /// `GET /tools`.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut prop = json!({
                "type": param.kind.as_schema_type(),
                "description": param.description,
            });
            if let Some(allowed) = &param.allowed {
                prop["enum"] = json!(allowed);
            }
            properties.insert(param.name.to_string(), prop);
        }

        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema(),
        })
    }
}

//
// ================= Outcomes =================
//

/// Structured failure detail captured at the dispatch boundary.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetail {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            details: None,
        }
    }
}

/// Tagged result of one tool dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(Value),
    Err(ErrorDetail),
}

impl ToolOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        ToolOutcome::Err(ErrorDetail::message(message))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, ToolOutcome::Err(_))
    }

    /// Render the envelope recorded in the interaction log and fed back to
    /// the model: the payload itself, or `{"error": {...}}`.
    pub fn into_value(self) -> Value {
        match self {
            ToolOutcome::Ok(value) => value,
            ToolOutcome::Err(detail) => json!({ "error": detail }),
        }
    }
}

//
// ================= Registry =================
//

/// A named family of tools sharing one backing client.
#[async_trait::async_trait]
pub trait ToolGroup: Send + Sync {
    fn descriptors(&self) -> &[ToolDescriptor];
    async fn call(&self, name: &str, arguments: &Value) -> ToolOutcome;
}

/// Looks up tools by exact name across all registered groups and
/// dispatches exactly once. Retries are the caller's decision.
pub struct ToolRegistry {
    groups: Vec<Arc<dyn ToolGroup>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn register(&mut self, group: Arc<dyn ToolGroup>) {
        self.groups.push(group);
    }

    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.groups
            .iter()
            .flat_map(|g| g.descriptors().iter())
            .collect()
    }

    fn find(&self, name: &str) -> Option<(&Arc<dyn ToolGroup>, &ToolDescriptor)> {
        self.groups.iter().find_map(|group| {
            group
                .descriptors()
                .iter()
                .find(|d| d.name == name)
                .map(|d| (group, d))
        })
    }

    pub async fn dispatch(&self, name: &str, arguments: &Value) -> ToolOutcome {
        let Some((group, descriptor)) = self.find(name) else {
            warn!(tool = name, "Tool not found in any group");
            return ToolOutcome::error(format!("Tool {} not found", name));
        };

        if let Err(detail) = validate_arguments(descriptor, arguments) {
            warn!(tool = name, error = %detail.message, "Rejected tool arguments");
            return ToolOutcome::Err(detail);
        }

        info!(tool = name, "Dispatching tool call");
        group.call(name, arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check declared presence and types before dispatch. Null stands in for
/// an empty argument object (the model omits arguments for no-param tools).
fn validate_arguments(descriptor: &ToolDescriptor, arguments: &Value) -> Result<(), ErrorDetail> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(ErrorDetail::message(format!(
                "Arguments for {} must be an object",
                descriptor.name
            )))
        }
    };

    for param in &descriptor.params {
        match args.get(param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(ErrorDetail::message(format!(
                    "Missing required parameter '{}' for {}",
                    param.name, descriptor.name
                )));
            }
            Some(value) if !value.is_null() && !param.kind.matches(value) => {
                return Err(ErrorDetail::message(format!(
                    "Parameter '{}' for {} must be of type {}",
                    param.name,
                    descriptor.name,
                    param.kind.as_schema_type()
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
