//! Gemini API client and the per-session inference channel
//!
//! The provider API is stateless; [`GeminiChannel`] owns the transcript
//! and replays it on every send. Uses a long-lived reqwest::Client for
//! connection pooling.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::AgentError;
use crate::tools::ToolDescriptor;
use crate::Result;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";

//
// ================= Client =================
//

/// Reusable Gemini client (connection-pooled).
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            model,
        }
    }

    pub fn from_env() -> Self {
        let api_key = env::var("GEMINI_API_KEY").unwrap_or_default();
        let model = env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, model)
    }

    /// One generateContent round-trip. Returns the model's content so the
    /// caller can append it to the transcript verbatim.
    async fn generate(&self, request: &GeminiRequest<'_>) -> Result<Content> {
        if self.api_key.is_empty() {
            return Err(AgentError::Config(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        info!(model = %self.model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AgentError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AgentError::Llm(format!("Gemini API error: {}", error_text)));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AgentError::Llm(format!("Gemini parse error: {}", e))
        })?;

        gemini_response
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content)
            .ok_or_else(|| AgentError::Llm("No response from Gemini API".to_string()))
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn function_response(name: impl Into<String>, response: Value) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.into(),
                response,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolsDecl],
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolsDecl {
    function_declarations: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1024,
        }
    }
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
}

//
// ================= Model Turn =================
//

/// One tool-call request extracted from a model response.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: Value,
}

/// A parsed model response: tool-call requests in request order, and/or
/// final text.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub calls: Vec<ToolCallRequest>,
}

impl ModelTurn {
    fn from_content(content: &Content) -> Self {
        let mut text_parts: Vec<&str> = Vec::new();
        let mut calls = Vec::new();

        for part in &content.parts {
            if let Some(t) = &part.text {
                text_parts.push(t);
            }
            if let Some(call) = &part.function_call {
                calls.push(ToolCallRequest {
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
            }
        }

        Self {
            text: (!text_parts.is_empty()).then(|| text_parts.join("")),
            calls,
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.calls.is_empty()
    }
}

//
// ================= Channel =================
//

/// The stateful, per-session conduit to the language model.
#[async_trait::async_trait]
pub trait InferenceChannel: Send + Sync {
    async fn send_user(&mut self, text: &str) -> Result<ModelTurn>;
    async fn send_tool_result(&mut self, name: &str, result: &Value) -> Result<ModelTurn>;
}

/// Builds channels. The session lifecycle rebuilds a channel whenever the
/// authentication framing of its system instruction changes.
pub trait ChannelFactory: Send + Sync {
    fn build(&self, system_instruction: String) -> Box<dyn InferenceChannel>;
}

pub struct GeminiChannel {
    client: Arc<GeminiClient>,
    tools: Vec<ToolsDecl>,
    system_instruction: String,
    transcript: Vec<Content>,
}

impl GeminiChannel {
    fn new(client: Arc<GeminiClient>, declarations: Vec<Value>, system_instruction: String) -> Self {
        Self {
            client,
            tools: vec![ToolsDecl {
                function_declarations: declarations,
            }],
            system_instruction,
            transcript: Vec::new(),
        }
    }

    async fn send(&mut self, content: Content) -> Result<ModelTurn> {
        self.transcript.push(content);

        let request = GeminiRequest {
            contents: &self.transcript,
            tools: &self.tools,
            generation_config: GenerationConfig::default(),
            system_instruction: SystemInstruction {
                parts: vec![Part::text(self.system_instruction.clone())],
            },
        };

        let mut reply = self.client.generate(&request).await?;
        if reply.role.is_empty() {
            reply.role = "model".to_string();
        }

        let turn = ModelTurn::from_content(&reply);
        self.transcript.push(reply);
        Ok(turn)
    }
}

#[async_trait::async_trait]
impl InferenceChannel for GeminiChannel {
    async fn send_user(&mut self, text: &str) -> Result<ModelTurn> {
        self.send(Content {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        })
        .await
    }

    async fn send_tool_result(&mut self, name: &str, result: &Value) -> Result<ModelTurn> {
        // The provider expects the payload wrapped under "result".
        self.send(Content {
            role: "user".to_string(),
            parts: vec![Part::function_response(
                name,
                json!({ "result": result }),
            )],
        })
        .await
    }
}

/// Default factory: channels share one pooled client and one rendered set
/// of tool declarations.
pub struct GeminiChannelFactory {
    client: Arc<GeminiClient>,
    declarations: Vec<Value>,
}

impl GeminiChannelFactory {
    pub fn new(client: Arc<GeminiClient>, descriptors: &[&ToolDescriptor]) -> Self {
        let declarations = descriptors
            .iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.input_schema(),
                })
            })
            .collect();

        Self {
            client,
            declarations,
        }
    }
}

impl ChannelFactory for GeminiChannelFactory {
    fn build(&self, system_instruction: String) -> Box<dyn InferenceChannel> {
        Box::new(GeminiChannel::new(
            self.client.clone(),
            self.declarations.clone(),
            system_instruction,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let contents = vec![Content {
            role: "user".to_string(),
            parts: vec![Part::text("Log me in please")],
        }];
        let tools = vec![ToolsDecl {
            function_declarations: vec![json!({
                "name": "vaulta_login",
                "description": "Login with email",
                "parameters": {"type": "object", "properties": {}, "required": []},
            })],
        }];

        let request = GeminiRequest {
            contents: &contents,
            tools: &tools,
            generation_config: GenerationConfig::default(),
            system_instruction: SystemInstruction {
                parts: vec![Part::text("You are a financial assistant")],
            },
        };

        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains("Log me in please"));
        assert!(encoded.contains("functionDeclarations"));
        assert!(encoded.contains("generationConfig"));
        assert!(encoded.contains("systemInstruction"));
        // Empty optional part fields must not serialize.
        assert!(!encoded.contains("functionCall"));
    }

    #[test]
    fn test_function_response_part_shape() {
        let part = Part::function_response("vaulta_login", json!({"result": {"ok": true}}));
        let encoded = serde_json::to_value(&part).unwrap();
        assert_eq!(encoded["functionResponse"]["name"], "vaulta_login");
        assert_eq!(encoded["functionResponse"]["response"]["result"]["ok"], true);
        assert!(encoded.get("text").is_none());
    }

    #[test]
    fn test_model_turn_extraction() {
        let content: Content = serde_json::from_value(json!({
            "role": "model",
            "parts": [
                {"functionCall": {"name": "vaulta_login", "args": {"email": "a@b.com"}}},
                {"functionCall": {"name": "update_status", "args": {"status": "AWAITING_OTP"}}},
            ],
        }))
        .unwrap();

        let turn = ModelTurn::from_content(&content);
        assert!(turn.wants_tools());
        assert_eq!(turn.calls.len(), 2);
        assert_eq!(turn.calls[0].name, "vaulta_login");
        assert_eq!(turn.calls[1].name, "update_status");
        assert!(turn.text.is_none());
    }

    #[test]
    fn test_model_turn_text_only() {
        let content: Content = serde_json::from_value(json!({
            "role": "model",
            "parts": [{"text": "Hi there! "}, {"text": "How can I help?"}],
        }))
        .unwrap();

        let turn = ModelTurn::from_content(&content);
        assert!(!turn.wants_tools());
        assert_eq!(turn.text.as_deref(), Some("Hi there! How can I help?"));
    }
}
