//! Session lifecycle and synchronization with the durable store
//!
//! Sessions are created lazily on first sight of a session id and
//! rehydrated from the store after a restart; the inference channel is
//! always rebuilt fresh, never restored. An authentication flip rebuilds
//! the channel with a re-framed system instruction. The history log
//! survives every rebuild.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::gemini::{ChannelFactory, InferenceChannel};
use crate::models::{Interaction, SessionRecord, UserContext};
use crate::store::SessionStore;
use crate::Result;

/// A live session: the durable record plus the per-session conduit to the
/// model. The channel never reaches the store.
pub struct Session {
    pub id: String,
    pub record: SessionRecord,
    pub channel: Box<dyn InferenceChannel>,
}

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionManager {
    live: RwLock<HashMap<String, SessionHandle>>,
    store: Arc<dyn SessionStore>,
    channels: Arc<dyn ChannelFactory>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            store,
            channels,
        }
    }

    /// Fetch the live session for an id, creating (or rehydrating) it on
    /// first sight. A change in the caller-derived authentication state
    /// rebuilds the inference channel with the other framing.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        auth_context: Option<&UserContext>,
    ) -> Result<SessionHandle> {
        if let Some(handle) = self.live.read().await.get(session_id).cloned() {
            self.refresh_auth(&handle, auth_context).await?;
            return Ok(handle);
        }

        let mut live = self.live.write().await;
        // Re-check: another worker may have built it while we waited.
        if let Some(handle) = live.get(session_id).cloned() {
            drop(live);
            self.refresh_auth(&handle, auth_context).await?;
            return Ok(handle);
        }

        let mut record = match self.store.load(session_id).await {
            Ok(Some(record)) => {
                info!(session = session_id, "Rehydrated session from store");
                record
            }
            Ok(None) => SessionRecord::default(),
            Err(e) => {
                warn!(session = session_id, error = %e, "Store load failed, starting fresh");
                SessionRecord::default()
            }
        };

        // Authentication is derived from this turn's context, never from a
        // stale stored flag. The stored token survives a degraded turn so a
        // transient provider outage does not log everyone out.
        let authenticated = auth_context.is_some_and(UserContext::is_authenticated);
        if let Some(context) = auth_context {
            record.user_context = context.clone();
        }
        record.authenticated = authenticated;
        info!(
            session = session_id,
            authenticated, "Creating session"
        );

        let session = Session {
            id: session_id.to_string(),
            channel: self
                .channels
                .build(system_instruction(authenticated, &record.user_context)),
            record,
        };

        self.store.save(session_id, &session.record).await?;

        let handle = Arc::new(Mutex::new(session));
        live.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Rebuild the channel when the derived authentication state differs
    /// from the stored one. The history log is untouched.
    async fn refresh_auth(
        &self,
        handle: &SessionHandle,
        auth_context: Option<&UserContext>,
    ) -> Result<()> {
        let is_authenticated = auth_context.is_some_and(UserContext::is_authenticated);

        let mut session = handle.lock().await;
        if session.record.authenticated == is_authenticated {
            return Ok(());
        }

        info!(
            session = %session.id,
            from = session.record.authenticated,
            to = is_authenticated,
            "Auth status changed, rebuilding inference channel"
        );

        session.record.user_context = auth_context.cloned().unwrap_or_default();
        session.record.authenticated = is_authenticated;

        session.channel = self
            .channels
            .build(system_instruction(is_authenticated, &session.record.user_context));

        self.store.save(&session.id, &session.record).await
    }

    /// Write a session's record through to the store.
    pub async fn persist(&self, session: &Session) -> Result<()> {
        self.store.save(&session.id, &session.record).await
    }

    /// Token remembered for a session, for requests that omit it.
    pub async fn remembered_token(&self, session_id: &str) -> Option<String> {
        if let Some(handle) = self.live.read().await.get(session_id).cloned() {
            return handle.lock().await.record.auth_token.clone();
        }
        match self.store.load(session_id).await {
            Ok(Some(record)) => record.auth_token,
            _ => None,
        }
    }

    pub async fn is_known(&self, session_id: &str) -> bool {
        if self.live.read().await.contains_key(session_id) {
            return true;
        }
        matches!(self.store.load(session_id).await, Ok(Some(_)))
    }

    pub async fn history(&self, session_id: &str) -> Option<Vec<Interaction>> {
        if let Some(handle) = self.live.read().await.get(session_id).cloned() {
            return Some(handle.lock().await.record.history.clone());
        }
        match self.store.load(session_id).await {
            Ok(Some(record)) => Some(record.history),
            _ => None,
        }
    }

    /// Remove a session from live memory and the store. Returns whether
    /// anything existed to remove.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let lived = self.live.write().await.remove(session_id).is_some();
        let stored = self.store.delete(session_id).await?;
        Ok(lived || stored)
    }
}

/// Build the per-session system instruction. The framing differs
/// materially between authenticated and unauthenticated sessions, which
/// is why an auth flip forces a channel rebuild.
fn system_instruction(authenticated: bool, context: &UserContext) -> String {
    let mut instruction = String::from(
        "You are Connect AI, a warm and friendly assistant for the Vaulta financial platform.

CONDUCT:
- Be conversational and human, like texting a helpful friend; emojis are welcome.
- Never mention tools, APIs, functions, or status codes to the user.
- Ask for at most one or two pieces of information at a time, then wait.
- Every service requires login first: guide new users through registration, existing users through login, before offering anything else.

AUTHENTICATION FLOW:
- Registration: collect name, then email, then phone, one step at a time; call vaulta_register; then walk the user through login.
- Login: ask for the email and call vaulta_login (this emails a one-time code and returns a temporary token). Ask the user for their code, then call vaulta_verify_otp with the code and that token. Never invent or guess a code.
- Logout on request via vaulta_logout; answer \"am I logged in\" via vaulta_auth_status.

STATUS REPORTING:
- After acting each turn, call update_status with the status code that best matches where the conversation stands (for example AWAITING_OTP while waiting for a login code, PAYMENT_ENTERING_AMOUNT while collecting a payment amount). This is internal bookkeeping; never show these codes to the user.

ONCE LOGGED IN you can offer: multi-currency accounts, balances, payments, trading quotes, transaction history, and API keys.
",
    );

    if authenticated {
        instruction.push_str("\nUSER IS LOGGED IN:\n");
        if let Some(email) = &context.email {
            instruction.push_str(&format!("- Email: {}\n", email));
        }
        if let Some(name) = &context.display_name {
            instruction.push_str(&format!("- Name: {}\n", name));
        }
        if let Some(phone) = &context.phone {
            instruction.push_str(&format!("- Phone: {}\n", phone));
        }
        if !context.accounts.is_empty() {
            instruction.push_str(&format!("- Vaulta accounts: {}\n", context.accounts.len()));
        }
        instruction.push_str("They're authenticated - offer Vaulta services freely.\n");
    } else {
        instruction.push_str(
            "\nUSER IS NOT LOGGED IN: find out whether they're new or returning and guide them through registration or login before anything else.\n",
        );
    }

    instruction
}
