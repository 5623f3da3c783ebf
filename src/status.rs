//! Conversation status codes and the resolver that derives them
//!
//! Status is derived from the interaction log, never stored as ground
//! truth. An explicit `update_status` signal wins over everything; the
//! text/tool-name heuristics below are a compatibility fallback for turns
//! where the model forgot to signal, and are bypassed entirely once it
//! participates correctly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{SessionRecord, ToolInvocation, UserContext};

/// Where the user currently stands in the conversation flow.
///
/// The wire representation is the SCREAMING_SNAKE_CASE label, used
/// verbatim in JSON responses and in the `update_status` tool schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    // Authentication states
    NotAuthenticated,
    AwaitingOtp,
    Authenticated,

    // Payment flow
    PaymentSelectingAccount,
    PaymentEnteringAmount,
    PaymentEnteringCurrency,
    PaymentEnteringDestination,
    ProcessingPayment,
    PaymentComplete,

    // Account management
    CreatingVaultaAccount,
    AccountCreated,
    ViewingAccounts,

    // Trading & history
    GettingQuote,
    QuoteReceived,
    ViewingTransactions,
    VaultaActive,

    // General states
    Idle,
    Processing,
    Error,
}

impl ConversationStatus {
    /// Every known status, in declaration order. Feeds the `update_status`
    /// tool schema as its literal allowed-value set.
    pub const ALL: &'static [ConversationStatus] = &[
        ConversationStatus::NotAuthenticated,
        ConversationStatus::AwaitingOtp,
        ConversationStatus::Authenticated,
        ConversationStatus::PaymentSelectingAccount,
        ConversationStatus::PaymentEnteringAmount,
        ConversationStatus::PaymentEnteringCurrency,
        ConversationStatus::PaymentEnteringDestination,
        ConversationStatus::ProcessingPayment,
        ConversationStatus::PaymentComplete,
        ConversationStatus::CreatingVaultaAccount,
        ConversationStatus::AccountCreated,
        ConversationStatus::ViewingAccounts,
        ConversationStatus::GettingQuote,
        ConversationStatus::QuoteReceived,
        ConversationStatus::ViewingTransactions,
        ConversationStatus::VaultaActive,
        ConversationStatus::Idle,
        ConversationStatus::Processing,
        ConversationStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::NotAuthenticated => "NOT_AUTHENTICATED",
            ConversationStatus::AwaitingOtp => "AWAITING_OTP",
            ConversationStatus::Authenticated => "AUTHENTICATED",
            ConversationStatus::PaymentSelectingAccount => "PAYMENT_SELECTING_ACCOUNT",
            ConversationStatus::PaymentEnteringAmount => "PAYMENT_ENTERING_AMOUNT",
            ConversationStatus::PaymentEnteringCurrency => "PAYMENT_ENTERING_CURRENCY",
            ConversationStatus::PaymentEnteringDestination => "PAYMENT_ENTERING_DESTINATION",
            ConversationStatus::ProcessingPayment => "PROCESSING_PAYMENT",
            ConversationStatus::PaymentComplete => "PAYMENT_COMPLETE",
            ConversationStatus::CreatingVaultaAccount => "CREATING_VAULTA_ACCOUNT",
            ConversationStatus::AccountCreated => "ACCOUNT_CREATED",
            ConversationStatus::ViewingAccounts => "VIEWING_ACCOUNTS",
            ConversationStatus::GettingQuote => "GETTING_QUOTE",
            ConversationStatus::QuoteReceived => "QUOTE_RECEIVED",
            ConversationStatus::ViewingTransactions => "VIEWING_TRANSACTIONS",
            ConversationStatus::VaultaActive => "VAULTA_ACTIVE",
            ConversationStatus::Idle => "IDLE",
            ConversationStatus::Processing => "PROCESSING",
            ConversationStatus::Error => "ERROR",
        }
    }

    pub fn parse(label: &str) -> Option<ConversationStatus> {
        Self::ALL.iter().find(|s| s.as_str() == label).copied()
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the signaling tool the model uses to assert status out-of-band.
pub const UPDATE_STATUS_TOOL: &str = "update_status";

/// Assistant phrases tied to each payment stage, scanned in this priority
/// order. First phrase match wins.
const PAYMENT_STAGE_PHRASES: &[(ConversationStatus, &[&str])] = &[
    (
        ConversationStatus::PaymentSelectingAccount,
        &[
            "which account",
            "select an account",
            "choose an account",
            "from which account",
        ],
    ),
    (
        ConversationStatus::PaymentEnteringAmount,
        &["how much", "what amount", "enter the amount"],
    ),
    (
        ConversationStatus::PaymentEnteringCurrency,
        &["which currency", "what currency", "in what currency"],
    ),
    (
        ConversationStatus::PaymentEnteringDestination,
        &[
            "destination address",
            "wallet address",
            "recipient address",
            "where should i send",
        ],
    ),
];

/// Derive the conversation status label for a session.
///
/// Precedence, first match wins:
/// 1. no session → NOT_AUTHENTICATED
/// 2. most recent explicit `update_status` signal, trusted verbatim
/// 3. unauthenticated with a just-initiated login → AWAITING_OTP
/// 4. unauthenticated otherwise → NOT_AUTHENTICATED
/// 5. phrase heuristics over the latest assistant message
/// 6. tool-name heuristics over the latest tool invocation
/// 7. AUTHENTICATED
pub fn resolve(session: Option<&SessionRecord>, auth_context: Option<&UserContext>) -> String {
    let Some(session) = session else {
        return ConversationStatus::NotAuthenticated.as_str().to_string();
    };

    if let Some(signal) = latest_explicit_signal(session) {
        return match ConversationStatus::parse(&signal) {
            Some(known) => known.as_str().to_string(),
            None => signal,
        };
    }

    let authenticated = auth_context.is_some_and(UserContext::is_authenticated);
    if !authenticated {
        if login_just_initiated(session) {
            return ConversationStatus::AwaitingOtp.as_str().to_string();
        }
        return ConversationStatus::NotAuthenticated.as_str().to_string();
    }

    if let Some(status) = status_from_assistant_text(session) {
        return status.as_str().to_string();
    }

    if let Some(status) = status_from_tool_calls(session) {
        return status.as_str().to_string();
    }

    ConversationStatus::Authenticated.as_str().to_string()
}

/// Newest-to-oldest scan for the signaling tool. The signal value is taken
/// from the invocation's arguments first, its result second; unknown
/// labels pass through unchanged.
///
/// A newer interaction that dispatched tools without signaling makes older
/// signals stale -- the tool evidence is fresher than the assertion -- so
/// the scan stops there and the heuristics take over. Pure text turns do
/// not invalidate a signal.
fn latest_explicit_signal(session: &SessionRecord) -> Option<String> {
    for interaction in session.history.iter().rev() {
        for call in interaction.tool_calls.iter().rev() {
            if call.function_name != UPDATE_STATUS_TOOL {
                continue;
            }
            if let Some(value) = signal_value(call) {
                return Some(value);
            }
        }
        if !interaction.tool_calls.is_empty() {
            return None;
        }
    }
    None
}

/// Extract a signal value from one invocation of the signaling tool:
/// arguments first, result second.
pub(crate) fn signal_value(call: &ToolInvocation) -> Option<String> {
    let from_args = call.arguments.get("status").and_then(|v| v.as_str());
    let from_result = call.result.get("status").and_then(|v| v.as_str());

    from_args
        .or(from_result)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn login_just_initiated(session: &SessionRecord) -> bool {
    session
        .last_interaction()
        .and_then(|i| i.tool_calls.last())
        .is_some_and(|call| call.function_name == "vaulta_login")
}

fn status_from_assistant_text(session: &SessionRecord) -> Option<ConversationStatus> {
    let text = session.last_interaction()?.assistant_message.to_lowercase();

    for (status, phrases) in PAYMENT_STAGE_PHRASES {
        if phrases.iter().any(|p| text.contains(p)) {
            return Some(*status);
        }
    }
    None
}

fn status_from_tool_calls(session: &SessionRecord) -> Option<ConversationStatus> {
    let call = session.last_interaction()?.tool_calls.last()?;
    let succeeded = call.result.get("error").is_none();

    let status = match call.function_name.as_str() {
        "vaulta_create_payment" => {
            if succeeded {
                ConversationStatus::PaymentComplete
            } else {
                ConversationStatus::Error
            }
        }
        "vaulta_create_account" => {
            if succeeded {
                ConversationStatus::AccountCreated
            } else {
                ConversationStatus::CreatingVaultaAccount
            }
        }
        "vaulta_get_all_accounts" => ConversationStatus::ViewingAccounts,
        "vaulta_get_all_transactions" => ConversationStatus::ViewingTransactions,
        "vaulta_get_quote" => {
            if succeeded {
                ConversationStatus::QuoteReceived
            } else {
                ConversationStatus::GettingQuote
            }
        }
        "vaulta_get_pairs" => ConversationStatus::GettingQuote,
        name if name.starts_with("vaulta_") => ConversationStatus::VaultaActive,
        _ => return None,
    };

    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interaction;
    use serde_json::json;

    fn call(name: &str, arguments: serde_json::Value, result: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            function_name: name.to_string(),
            arguments,
            result,
        }
    }

    fn interaction(assistant: &str, calls: Vec<ToolInvocation>) -> Interaction {
        Interaction {
            user_message: "..".to_string(),
            assistant_message: assistant.to_string(),
            tool_calls: calls,
        }
    }

    fn authenticated_context() -> UserContext {
        UserContext {
            email: Some("a@b.com".to_string()),
            ..Default::default()
        }
    }

    fn session_with(history: Vec<Interaction>) -> SessionRecord {
        SessionRecord {
            history,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_session_is_not_authenticated() {
        assert_eq!(resolve(None, None), "NOT_AUTHENTICATED");
    }

    #[test]
    fn test_authenticated_empty_history() {
        let session = session_with(vec![]);
        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "AUTHENTICATED"
        );
    }

    #[test]
    fn test_explicit_signal_beats_heuristics() {
        // Assistant text and tool calls both point at the payment flow, but
        // the explicit signal wins.
        let session = session_with(vec![interaction(
            "Which account should I debit? Also, how much?",
            vec![
                call("vaulta_get_all_accounts", json!({}), json!({"accounts": []})),
                call(
                    UPDATE_STATUS_TOOL,
                    json!({"status": "PAYMENT_COMPLETE"}),
                    json!({"status": "PAYMENT_COMPLETE", "updated": true}),
                ),
            ],
        )]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "PAYMENT_COMPLETE"
        );
    }

    #[test]
    fn test_signal_prefers_arguments_over_result() {
        let session = session_with(vec![interaction(
            "Done!",
            vec![call(
                UPDATE_STATUS_TOOL,
                json!({"status": "GETTING_QUOTE"}),
                json!({"status": "QUOTE_RECEIVED"}),
            )],
        )]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "GETTING_QUOTE"
        );
    }

    #[test]
    fn test_unknown_signal_passes_through() {
        let session = session_with(vec![interaction(
            "On it.",
            vec![call(
                UPDATE_STATUS_TOOL,
                json!({"status": "SOMETHING_NEW"}),
                json!({"status": "SOMETHING_NEW", "updated": true}),
            )],
        )]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "SOMETHING_NEW"
        );
    }

    #[test]
    fn test_pending_login_awaits_otp() {
        let session = session_with(vec![interaction(
            "I've sent a code to your email.",
            vec![call(
                "vaulta_login",
                json!({"email": "a@b.com"}),
                json!({"access_token": "tmp", "message": "OTP sent"}),
            )],
        )]);

        assert_eq!(resolve(Some(&session), None), "AWAITING_OTP");
    }

    #[test]
    fn test_unauthenticated_without_pending_login() {
        let session = session_with(vec![interaction("Hello! Please log in first.", vec![])]);
        assert_eq!(resolve(Some(&session), None), "NOT_AUTHENTICATED");
    }

    #[test]
    fn test_phrase_heuristic_payment_stages() {
        let cases = vec![
            ("Which account would you like to pay from?", "PAYMENT_SELECTING_ACCOUNT"),
            ("Great choice! How much do you want to send?", "PAYMENT_ENTERING_AMOUNT"),
            ("And in what currency?", "PAYMENT_ENTERING_CURRENCY"),
            ("What's the destination address?", "PAYMENT_ENTERING_DESTINATION"),
        ];

        for (text, expected) in cases {
            let session = session_with(vec![interaction(text, vec![])]);
            assert_eq!(
                resolve(Some(&session), Some(&authenticated_context())),
                expected,
                "text: {text}"
            );
        }
    }

    #[test]
    fn test_stage_priority_order() {
        // Account selection outranks amount when both phrases appear.
        let session = session_with(vec![interaction(
            "How much, and from which account?",
            vec![],
        )]);
        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "PAYMENT_SELECTING_ACCOUNT"
        );
    }

    #[test]
    fn test_tool_heuristic_payment_outcomes() {
        let ok = session_with(vec![interaction(
            "Payment sent!",
            vec![call("vaulta_create_payment", json!({}), json!({"id": "p1"}))],
        )]);
        assert_eq!(
            resolve(Some(&ok), Some(&authenticated_context())),
            "PAYMENT_COMPLETE"
        );

        let failed = session_with(vec![interaction(
            "That didn't go through.",
            vec![call(
                "vaulta_create_payment",
                json!({}),
                json!({"error": {"message": "insufficient funds"}}),
            )],
        )]);
        assert_eq!(
            resolve(Some(&failed), Some(&authenticated_context())),
            "ERROR"
        );
    }

    #[test]
    fn test_signal_superseded_by_later_unsignaled_tool_turn() {
        // Turn 1 carries an explicit CREATING_VAULTA_ACCOUNT signal; turn 2
        // completes the creation without signaling. The newer tool evidence
        // supersedes the stale assertion.
        let session = session_with(vec![
            interaction(
                "Let's set up your account.",
                vec![call(
                    UPDATE_STATUS_TOOL,
                    json!({"status": "CREATING_VAULTA_ACCOUNT"}),
                    json!({"status": "CREATING_VAULTA_ACCOUNT", "updated": true}),
                )],
            ),
            interaction(
                "Your account is ready!",
                vec![call(
                    "vaulta_create_account",
                    json!({"name": "Main", "currency": "USD"}),
                    json!({"id": "acc1"}),
                )],
            ),
        ]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "ACCOUNT_CREATED"
        );
    }

    #[test]
    fn test_signal_survives_pure_text_turns() {
        let session = session_with(vec![
            interaction(
                "Processing your payment now.",
                vec![call(
                    UPDATE_STATUS_TOOL,
                    json!({"status": "PROCESSING_PAYMENT"}),
                    json!({"status": "PROCESSING_PAYMENT", "updated": true}),
                )],
            ),
            interaction("Still on it, one moment!", vec![]),
        ]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "PROCESSING_PAYMENT"
        );
    }

    #[test]
    fn test_account_created_without_any_signal() {
        let session = session_with(vec![
            interaction("Let's set up your account.", vec![]),
            interaction(
                "Your account is ready!",
                vec![call(
                    "vaulta_create_account",
                    json!({"name": "Main", "currency": "USD"}),
                    json!({"id": "acc1"}),
                )],
            ),
        ]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "ACCOUNT_CREATED"
        );
    }

    #[test]
    fn test_generic_provider_tool_is_active() {
        let session = session_with(vec![interaction(
            "Here are today's rates.",
            vec![call("vaulta_get_cron_rates", json!({}), json!({"rates": {}}))],
        )]);

        assert_eq!(
            resolve(Some(&session), Some(&authenticated_context())),
            "VAULTA_ACTIVE"
        );
    }

    #[test]
    fn test_parse_round_trips_every_label() {
        for status in ConversationStatus::ALL {
            assert_eq!(ConversationStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(ConversationStatus::parse("NOT_A_STATUS"), None);
    }
}
