//! Turn orchestrator - the bounded inference/tool loop
//!
//! One turn: submit the utterance, dispatch whatever tools the model
//! requests in request order, feed each result back, and stop at the
//! first response with no tool-call requests. The round ceiling turns a
//! model stuck in a tool loop from an unbounded liveness risk into a
//! bounded, observable failure.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{Interaction, ToolInvocation, TurnResult};
use crate::session::Session;
use crate::status::{signal_value, ConversationStatus, UPDATE_STATUS_TOOL};
use crate::tools::ToolRegistry;
use crate::Result;

/// Upper bound on inference rounds per turn.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// Fallback reply when the ceiling is reached without final text.
const EXHAUSTED_FALLBACK: &str =
    "Sorry, I got a bit tangled up working on that. Could you try rephrasing your request? 😅";

/// Canonical prompt substituted when the model fabricates or leaks a
/// one-time code instead of asking the user for theirs.
const OTP_PROMPT: &str =
    "I've sent a one-time code to your email. Could you share that code here so I can log you in? 😊";

/// Words that count as mentioning the one-time-code concept.
const OTP_MENTIONS: &[&str] = &["otp", "one-time", "one time", "code", "verification"];

pub struct TurnOrchestrator {
    registry: Arc<ToolRegistry>,
    max_rounds: usize,
}

impl TurnOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            max_rounds: MAX_TOOL_ROUNDS,
        }
    }

    #[cfg(test)]
    fn with_max_rounds(registry: Arc<ToolRegistry>, max_rounds: usize) -> Self {
        Self {
            registry,
            max_rounds,
        }
    }

    /// Run one user turn to completion, appending the finished
    /// [`Interaction`] to the session history before returning.
    pub async fn run_turn(&self, session: &mut Session, user_message: &str) -> Result<TurnResult> {
        info!(session = %session.id, "Processing user message");

        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut final_text: Option<String> = None;

        let mut turn = session.channel.send_user(user_message).await?;

        for round in 1..=self.max_rounds {
            if !turn.wants_tools() {
                final_text = turn.text.take();
                break;
            }

            debug!(round, calls = turn.calls.len(), "Dispatching requested tools");

            let calls = std::mem::take(&mut turn.calls);
            for call in calls {
                let outcome = self.registry.dispatch(&call.name, &call.args).await;
                let result = outcome.into_value();

                invocations.push(ToolInvocation {
                    function_name: call.name.clone(),
                    arguments: call.args,
                    result: result.clone(),
                });

                turn = session.channel.send_tool_result(&call.name, &result).await?;
            }
        }

        let assistant_message = match final_text {
            Some(text) if !text.is_empty() => text,
            _ => {
                warn!(
                    session = %session.id,
                    invocations = invocations.len(),
                    "Turn ended without final text, substituting fallback"
                );
                EXHAUSTED_FALLBACK.to_string()
            }
        };

        let assistant_message = apply_otp_guard(session, &invocations, assistant_message);

        session.record.history.push(Interaction {
            user_message: user_message.to_string(),
            assistant_message: assistant_message.clone(),
            tool_calls: invocations.clone(),
        });

        Ok(TurnResult {
            assistant_message,
            tool_invocations: invocations,
        })
    }
}

/// Guard against a known model failure mode: after initiating a login it
/// sometimes invents the 6-digit code (or answers without asking for one)
/// instead of asking the user for theirs. Only fires while the session is
/// still unauthenticated and the turn's own signal says AWAITING_OTP.
fn apply_otp_guard(session: &Session, invocations: &[ToolInvocation], text: String) -> String {
    let login_dispatched = invocations
        .iter()
        .any(|call| call.function_name == "vaulta_login");
    if !login_dispatched || session.record.authenticated {
        return text;
    }

    let awaiting_otp = invocations
        .iter()
        .rev()
        .filter(|call| call.function_name == UPDATE_STATUS_TOOL)
        .find_map(signal_value)
        .is_some_and(|signal| signal == ConversationStatus::AwaitingOtp.as_str());
    if !awaiting_otp {
        return text;
    }

    if is_bare_six_digits(&text) || !mentions_code(&text) {
        warn!(session = %session.id, "Replacing unsafe post-login reply with OTP prompt");
        return OTP_PROMPT.to_string();
    }

    text
}

fn is_bare_six_digits(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit())
}

fn mentions_code(text: &str) -> bool {
    let lowered = text.to_lowercase();
    OTP_MENTIONS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::{InferenceChannel, ModelTurn, ToolCallRequest};
    use crate::models::SessionRecord;
    use crate::status;
    use crate::tools::status::StatusTools;
    use crate::tools::{ParamKind, ParameterSpec, ToolDescriptor, ToolGroup, ToolOutcome};
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Channel that replays a fixed script of model turns; once the script
    /// runs out it repeats the last turn forever.
    struct ScriptedChannel {
        script: VecDeque<ModelTurn>,
        repeat: ModelTurn,
    }

    impl ScriptedChannel {
        fn new(script: Vec<ModelTurn>) -> Self {
            let repeat = script.last().cloned().unwrap_or_default();
            Self {
                script: script.into(),
                repeat,
            }
        }

        fn next_turn(&mut self) -> ModelTurn {
            self.script.pop_front().unwrap_or_else(|| self.repeat.clone())
        }
    }

    #[async_trait::async_trait]
    impl InferenceChannel for ScriptedChannel {
        async fn send_user(&mut self, _text: &str) -> crate::Result<ModelTurn> {
            Ok(self.next_turn())
        }

        async fn send_tool_result(&mut self, _name: &str, _result: &Value) -> crate::Result<ModelTurn> {
            Ok(self.next_turn())
        }
    }

    fn text_turn(text: &str) -> ModelTurn {
        ModelTurn {
            text: Some(text.to_string()),
            calls: vec![],
        }
    }

    fn call_turn(calls: Vec<(&str, Value)>) -> ModelTurn {
        ModelTurn {
            text: None,
            calls: calls
                .into_iter()
                .map(|(name, args)| ToolCallRequest {
                    name: name.to_string(),
                    args,
                })
                .collect(),
        }
    }

    /// Mock login/OTP backend, standing in for the live provider group.
    struct MockBank {
        descriptors: Vec<ToolDescriptor>,
    }

    impl MockBank {
        fn new() -> Self {
            Self {
                descriptors: vec![
                    ToolDescriptor::new(
                        "vaulta_login",
                        "Login with email",
                        vec![ParameterSpec::required(
                            "email",
                            ParamKind::String,
                            "User email address",
                        )],
                    ),
                    ToolDescriptor::new(
                        "vaulta_verify_otp",
                        "Verify OTP",
                        vec![
                            ParameterSpec::required("otp", ParamKind::String, "OTP code"),
                            ParameterSpec::required("token", ParamKind::String, "Temp token"),
                        ],
                    ),
                ],
            }
        }
    }

    #[async_trait::async_trait]
    impl ToolGroup for MockBank {
        fn descriptors(&self) -> &[ToolDescriptor] {
            &self.descriptors
        }

        async fn call(&self, name: &str, _arguments: &Value) -> ToolOutcome {
            match name {
                "vaulta_login" => ToolOutcome::Ok(json!({
                    "access_token": "tok1",
                    "message": "OTP sent",
                })),
                "vaulta_verify_otp" => ToolOutcome::Ok(json!({"access_token": "tok2"})),
                other => ToolOutcome::error(format!("Tool {} not found", other)),
            }
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(std::sync::Arc::new(MockBank::new()));
        registry.register(std::sync::Arc::new(StatusTools::new()));
        Arc::new(registry)
    }

    fn session(script: Vec<ModelTurn>) -> Session {
        Session {
            id: "s1".to_string(),
            record: SessionRecord::default(),
            channel: Box::new(ScriptedChannel::new(script)),
        }
    }

    #[tokio::test]
    async fn test_plain_text_turn() {
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![text_turn("Hello! How can I help today?")]);

        let result = orchestrator.run_turn(&mut session, "hi").await.unwrap();

        assert_eq!(result.assistant_message, "Hello! How can I help today?");
        assert!(result.tool_invocations.is_empty());
        assert_eq!(session.record.history.len(), 1);
        assert_eq!(session.record.history[0].user_message, "hi");
    }

    #[tokio::test]
    async fn test_ceiling_terminates_runaway_model() {
        // The scripted channel requests a tool on every single response.
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![call_turn(vec![(
            UPDATE_STATUS_TOOL,
            json!({"status": "PROCESSING"}),
        )])]);

        let result = orchestrator.run_turn(&mut session, "loop").await.unwrap();

        assert_eq!(result.tool_invocations.len(), MAX_TOOL_ROUNDS);
        assert_eq!(result.assistant_message, EXHAUSTED_FALLBACK);
        // The turn is still recorded.
        assert_eq!(session.record.history.len(), 1);
        assert_eq!(
            session.record.history[0].tool_calls.len(),
            MAX_TOOL_ROUNDS
        );
    }

    #[tokio::test]
    async fn test_small_ceiling_is_respected() {
        let orchestrator = TurnOrchestrator::with_max_rounds(registry(), 3);
        let mut session = session(vec![call_turn(vec![(
            UPDATE_STATUS_TOOL,
            json!({"status": "PROCESSING"}),
        )])]);

        let result = orchestrator.run_turn(&mut session, "loop").await.unwrap();
        assert_eq!(result.tool_invocations.len(), 3);
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_not_raised() {
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![
            call_turn(vec![("no_such_tool", json!({}))]),
            text_turn("Hmm, that didn't work, let me try another way."),
        ]);

        let result = orchestrator.run_turn(&mut session, "do it").await.unwrap();

        assert_eq!(result.tool_invocations.len(), 1);
        assert_eq!(
            result.tool_invocations[0].result["error"]["message"],
            "Tool no_such_tool not found"
        );
        assert!(result.assistant_message.contains("another way"));
    }

    #[tokio::test]
    async fn test_dispatch_preserves_request_order() {
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![
            call_turn(vec![
                ("vaulta_login", json!({"email": "a@b.com"})),
                (UPDATE_STATUS_TOOL, json!({"status": "AWAITING_OTP"})),
            ]),
            // One continuation per fed-back result.
            call_turn(vec![(UPDATE_STATUS_TOOL, json!({"status": "AWAITING_OTP"}))]),
            text_turn("Please check your email for the one-time code."),
        ]);

        let result = orchestrator.run_turn(&mut session, "log me in").await.unwrap();

        assert_eq!(result.tool_invocations[0].function_name, "vaulta_login");
        assert_eq!(result.tool_invocations[1].function_name, UPDATE_STATUS_TOOL);
    }

    #[tokio::test]
    async fn test_otp_guard_replaces_fabricated_code() {
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![
            call_turn(vec![
                ("vaulta_login", json!({"email": "a@b.com"})),
                (UPDATE_STATUS_TOOL, json!({"status": "AWAITING_OTP"})),
            ]),
            // Model tries to "helpfully" answer with a code of its own.
            text_turn("482913"),
        ]);

        let result = orchestrator
            .run_turn(&mut session, "I want to login")
            .await
            .unwrap();

        assert_eq!(result.assistant_message, OTP_PROMPT);

        // The recorded history resolves to AWAITING_OTP via the explicit signal.
        assert_eq!(
            status::resolve(Some(&session.record), None),
            "AWAITING_OTP"
        );
    }

    #[tokio::test]
    async fn test_otp_guard_replaces_reply_that_never_mentions_code() {
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![
            call_turn(vec![
                ("vaulta_login", json!({"email": "a@b.com"})),
                (UPDATE_STATUS_TOOL, json!({"status": "AWAITING_OTP"})),
            ]),
            text_turn("You're all logged in now! What would you like to do?"),
        ]);

        let result = orchestrator
            .run_turn(&mut session, "I want to login")
            .await
            .unwrap();

        assert_eq!(result.assistant_message, OTP_PROMPT);
    }

    #[tokio::test]
    async fn test_otp_guard_keeps_well_formed_prompt() {
        let orchestrator = TurnOrchestrator::new(registry());
        let reply = "I've emailed you a one-time code - could you share it here?";
        let mut session = session(vec![
            call_turn(vec![
                ("vaulta_login", json!({"email": "a@b.com"})),
                (UPDATE_STATUS_TOOL, json!({"status": "AWAITING_OTP"})),
            ]),
            text_turn(reply),
        ]);

        let result = orchestrator
            .run_turn(&mut session, "I want to login")
            .await
            .unwrap();

        assert_eq!(result.assistant_message, reply);
    }

    #[tokio::test]
    async fn test_otp_guard_skipped_without_login() {
        // A six-digit reply is fine when no login was initiated this turn.
        let orchestrator = TurnOrchestrator::new(registry());
        let mut session = session(vec![text_turn("123456")]);

        let result = orchestrator.run_turn(&mut session, "guess").await.unwrap();
        assert_eq!(result.assistant_message, "123456");
    }
}
