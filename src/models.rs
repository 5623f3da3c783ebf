//! Core data models for the conversational agent

use serde::{Deserialize, Serialize};
use serde_json::Value;

//
// ================= User Context =================
//

/// User profile context fetched from the identity provider.
///
/// Everything is optional: an empty context is simply an unauthenticated
/// user. `accounts` holds the provider's account objects verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserContext {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub accounts: Vec<Value>,
    pub external_user_id: Option<String>,
}

impl UserContext {
    /// A context without a non-empty email is never authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.is_empty())
    }
}

//
// ================= Interaction Log =================
//

/// One tool dispatch within a turn.
///
/// Owned exclusively by its [`Interaction`]; `result` is either the tool's
/// payload or an `{"error": {...}}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub function_name: String,
    pub arguments: Value,
    pub result: Value,
}

/// One user turn: the utterance, the final assistant text, and every tool
/// dispatch in between, in dispatch order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub user_message: String,
    pub assistant_message: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

//
// ================= Session Record =================
//

/// The durable portion of a session.
///
/// Written wholesale to the store on every persist; `authToken` is
/// serialized even when null so rehydration is unambiguous.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRecord {
    pub history: Vec<Interaction>,
    pub user_context: UserContext,
    pub auth_token: Option<String>,
    pub authenticated: bool,
}

impl SessionRecord {
    pub fn last_interaction(&self) -> Option<&Interaction> {
        self.history.last()
    }

    /// Update authentication material, keeping the invariant that
    /// `authenticated` implies both a token and a non-empty email.
    pub fn set_auth(&mut self, token: Option<String>, context: UserContext) {
        self.authenticated = token.is_some() && context.is_authenticated();
        self.auth_token = token;
        self.user_context = context;
    }

    /// Drop all authentication material (logout or expired token).
    pub fn clear_auth(&mut self) {
        self.auth_token = None;
        self.user_context = UserContext::default();
        self.authenticated = false;
    }
}

//
// ================= Turn Result =================
//

/// What [`crate::orchestrator::TurnOrchestrator::run_turn`] hands back.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub assistant_message: String,
    pub tool_invocations: Vec<ToolInvocation>,
}
