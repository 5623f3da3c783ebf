//! Vaulta platform tool group
//!
//! HTTP-backed tools over the Vaulta payments API: one pooled client, a
//! bearer-token slot shared with the session layer, and a structured error
//! envelope (message, status code, provider detail) on every failure.

use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::env;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ErrorDetail, ParamKind, ParameterSpec, ToolDescriptor, ToolGroup, ToolOutcome};
use crate::models::UserContext;

const DEFAULT_BASE_URL: &str = "https://backend.vaultadigital.com";

/// Keys an access token may hide under in provider responses.
const TOKEN_KEYS: [&str; 4] = ["access_token", "token", "bearer", "accessToken"];

//
// ================= Client =================
//

/// Client for Vaulta API interactions.
pub struct VaultaClient {
    client: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
}

impl VaultaClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
        }
    }

    pub fn from_env() -> Self {
        let base_url =
            env::var("VAULTA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url)
    }

    pub fn set_access_token(&self, token: &str) {
        if let Ok(mut slot) = self.access_token.write() {
            *slot = Some(token.to_string());
        }
    }

    pub fn clear_access_token(&self) {
        if let Ok(mut slot) = self.access_token.write() {
            *slot = None;
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn bearer(&self) -> Option<String> {
        self.access_token.read().ok().and_then(|slot| slot.clone())
    }

    /// One HTTP round-trip, captured into a tool outcome. Transport
    /// failures and non-2xx responses both land in the error envelope;
    /// nothing is raised past this boundary.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        idempotency_key: Option<String>,
    ) -> ToolOutcome {
        let url = format!("{}{}", self.base_url, endpoint);
        info!(%method, %url, "Vaulta request");

        let mut builder = self.client.request(method, &url);
        if let Some(token) = self.bearer() {
            builder = builder.bearer_auth(token);
        }
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "Vaulta request failed");
                return ToolOutcome::Err(ErrorDetail {
                    message: e.to_string(),
                    status_code: e.status().map(|s| s.as_u16()),
                    details: None,
                });
            }
        };

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "Vaulta error response");
            return ToolOutcome::Err(ErrorDetail {
                message: format!("Vaulta API returned {} for {}", status, endpoint),
                status_code: Some(status.as_u16()),
                details: (!payload.is_null()).then_some(payload),
            });
        }

        ToolOutcome::Ok(payload)
    }

    async fn get(&self, endpoint: &str) -> ToolOutcome {
        self.request(Method::GET, endpoint, None, None).await
    }

    async fn post(&self, endpoint: &str, body: Value) -> ToolOutcome {
        self.request(Method::POST, endpoint, Some(body), None).await
    }

    async fn put(&self, endpoint: &str, body: Value) -> ToolOutcome {
        self.request(Method::PUT, endpoint, Some(body), None).await
    }

    async fn delete(&self, endpoint: &str) -> ToolOutcome {
        self.request(Method::DELETE, endpoint, None, None).await
    }
}

/// Copy the listed keys out of the model's arguments, skipping absent and
/// null entries, so optional fields never reach the provider as nulls.
fn pick(arguments: &Value, keys: &[&str]) -> Value {
    let mut body = Map::new();
    if let Some(args) = arguments.as_object() {
        for key in keys {
            if let Some(value) = args.get(*key) {
                if !value.is_null() {
                    body.insert(key.to_string(), value.clone());
                }
            }
        }
    }
    Value::Object(body)
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> &'a str {
    arguments.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

/// Find an access token in the provider's various response shapes:
/// well-known keys at the top level, then nested under `data`.
fn extract_token(response: &Value) -> Option<String> {
    let direct = TOKEN_KEYS
        .iter()
        .find_map(|key| response.get(*key).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty());
    if let Some(token) = direct {
        return Some(token.to_string());
    }

    let data = response.get("data")?;
    TOKEN_KEYS
        .iter()
        .find_map(|key| data.get(*key).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

//
// ================= Tool Group =================
//

pub struct VaultaTools {
    client: VaultaClient,
    descriptors: Vec<ToolDescriptor>,
}

impl VaultaTools {
    pub fn new(client: VaultaClient) -> Self {
        Self {
            client,
            descriptors: define_tools(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(VaultaClient::from_env())
    }

    pub fn set_access_token(&self, token: &str) {
        self.client.set_access_token(token);
    }

    pub fn clear_access_token(&self) {
        self.client.clear_access_token();
    }

    /// Identity collaborator boundary: install the bearer token and fetch
    /// the current user's profile. Provider errors and responses without
    /// an email degrade to `None` -- not authenticated for this turn.
    pub async fn fetch_current_user(&self, token: &str) -> Option<UserContext> {
        self.client.set_access_token(token);

        let payload = match self.client.get("/account").await {
            ToolOutcome::Ok(payload) => payload,
            ToolOutcome::Err(detail) => {
                warn!(error = %detail.message, "Current-user lookup failed");
                return None;
            }
        };

        let user = payload.get("user").cloned().unwrap_or(Value::Null);
        let email = user
            .get("email")
            .and_then(|v| v.as_str())
            .filter(|e| !e.is_empty())?
            .to_string();

        let first = user.get("first_name").and_then(|v| v.as_str()).unwrap_or_default();
        let last = user.get("last_name").and_then(|v| v.as_str()).unwrap_or_default();
        let display_name = format!("{} {}", first, last).trim().to_string();

        Some(UserContext {
            email: Some(email),
            display_name: (!display_name.is_empty()).then_some(display_name),
            phone: user
                .get("phone")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            accounts: payload
                .get("accounts")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            external_user_id: user.get("id").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        })
    }

    fn handle_set_token(&self, arguments: &Value) -> ToolOutcome {
        self.client.set_access_token(str_arg(arguments, "token"));
        ToolOutcome::Ok(json!({"status": "ok", "message": "Access token set"}))
    }

    fn handle_logout(&self) -> ToolOutcome {
        self.client.clear_access_token();
        ToolOutcome::Ok(json!({"status": "ok", "message": "Logged out"}))
    }

    async fn handle_auth_status(&self) -> ToolOutcome {
        if !self.client.has_access_token() {
            return ToolOutcome::Ok(json!({"authenticated": false}));
        }

        match self.client.get("/account").await {
            ToolOutcome::Ok(payload) => {
                let user = payload.get("user").cloned().unwrap_or(Value::Null);
                let first = user.get("first_name").and_then(|v| v.as_str()).unwrap_or_default();
                let last = user.get("last_name").and_then(|v| v.as_str()).unwrap_or_default();
                let accounts = payload
                    .get("accounts")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);

                ToolOutcome::Ok(json!({
                    "authenticated": true,
                    "email": user.get("email").cloned().unwrap_or(Value::Null),
                    "name": format!("{} {}", first, last).trim(),
                    "accounts_count": accounts,
                }))
            }
            ToolOutcome::Err(detail) => ToolOutcome::Ok(json!({
                "authenticated": false,
                "error": detail,
            })),
        }
    }

    /// Login returns a temporary token and triggers the OTP email. The
    /// token is not installed -- it only becomes a bearer credential after
    /// OTP verification.
    async fn handle_login(&self, arguments: &Value) -> ToolOutcome {
        self.client
            .post("/login", pick(arguments, &["email"]))
            .await
    }

    /// Verify the OTP; when the provider hands back an access token in any
    /// of its known shapes, install it and echo it as `access_token` for
    /// session-level handling.
    async fn handle_verify_otp(&self, arguments: &Value) -> ToolOutcome {
        let outcome = self
            .client
            .post("/verify-otp", pick(arguments, &["otp", "token"]))
            .await;

        match outcome {
            ToolOutcome::Ok(mut payload) => {
                if let Some(token) = extract_token(&payload) {
                    self.client.set_access_token(&token);
                    payload["access_token"] = json!(token);
                }
                ToolOutcome::Ok(payload)
            }
            err => err,
        }
    }

    async fn handle_create_payment(&self, arguments: &Value) -> ToolOutcome {
        let body = pick(
            arguments,
            &[
                "source_account_id",
                "amount",
                "currency",
                "destination",
                "description",
                "client_reference",
            ],
        );

        // One idempotency key per dispatch: a retried turn is a new payment
        // attempt, a provider-side retry is not.
        let key = Uuid::new_v4().to_string();
        self.client
            .request(Method::POST, "/api/v1/payments", Some(body), Some(key))
            .await
    }

    async fn handle_create_transaction(&self, arguments: &Value) -> ToolOutcome {
        let mut body = pick(arguments, &["amount", "currency"]);
        body["type"] = arguments
            .get("transaction_type")
            .cloned()
            .unwrap_or(Value::Null);
        body["status"] = arguments
            .get("status")
            .cloned()
            .unwrap_or_else(|| json!("pending"));

        self.client.post("/api/v1/transaction", body).await
    }
}

#[async_trait::async_trait]
impl ToolGroup for VaultaTools {
    fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    async fn call(&self, name: &str, arguments: &Value) -> ToolOutcome {
        match name {
            "vaulta_set_access_token" => self.handle_set_token(arguments),
            "vaulta_logout" => self.handle_logout(),
            "vaulta_auth_status" => self.handle_auth_status().await,
            "vaulta_login" => self.handle_login(arguments).await,
            "vaulta_verify_otp" => self.handle_verify_otp(arguments).await,
            "vaulta_register" => {
                self.client
                    .post(
                        "/register",
                        pick(arguments, &["first_name", "last_name", "email", "phone"]),
                    )
                    .await
            }
            "vaulta_get_current_user" => self.client.get("/account").await,
            "vaulta_create_account" => {
                self.client
                    .post(
                        "/api/v1/create_account",
                        pick(arguments, &["name", "currency", "metadata"]),
                    )
                    .await
            }
            "vaulta_get_all_accounts" => self.client.get("/api/v1/accounts").await,
            "vaulta_update_account" => {
                let path = format!("/api/v1/accounts/{}", str_arg(arguments, "account_id"));
                self.client
                    .put(&path, pick(arguments, &["name", "currency", "metadata"]))
                    .await
            }
            "vaulta_delete_account" => {
                let path = format!("/api/v1/accounts/{}", str_arg(arguments, "account_id"));
                self.client.delete(&path).await
            }
            "vaulta_create_payment" => self.handle_create_payment(arguments).await,
            "vaulta_get_payment" => {
                let path = format!("/api/v1/payments/{}", str_arg(arguments, "payment_id"));
                self.client.get(&path).await
            }
            "vaulta_get_quote" => {
                self.client
                    .post(
                        "/api/v1/get_quote",
                        pick(arguments, &["pair", "side", "amount_crypto", "amount_fiat"]),
                    )
                    .await
            }
            "vaulta_get_pairs" => self.client.get("/api/v1/pairs").await,
            "vaulta_get_cron_rates" => self.client.get("/api/v1/cron_rates").await,
            "vaulta_create_transaction" => self.handle_create_transaction(arguments).await,
            "vaulta_get_all_transactions" => self.client.get("/api/v1/transactions").await,
            "vaulta_get_transaction" => {
                let path = format!(
                    "/api/v1/transactions/{}",
                    str_arg(arguments, "transaction_id")
                );
                self.client.get(&path).await
            }
            "vaulta_create_api_key" => self.client.post("/api/v1/create_api_key", json!({})).await,
            "vaulta_get_api_keys" => self.client.get("/api/v1/api_keys").await,
            other => ToolOutcome::error(format!("Tool {} not found", other)),
        }
    }
}

fn define_tools() -> Vec<ToolDescriptor> {
    use ParamKind::*;

    vec![
        ToolDescriptor::new(
            "vaulta_set_access_token",
            "Set the OAuth2 Bearer token for authenticated requests",
            vec![ParameterSpec::required(
                "token",
                String,
                "Bearer access token returned after OTP verification",
            )],
        ),
        ToolDescriptor::new(
            "vaulta_logout",
            "Logout by clearing the current bearer token",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_auth_status",
            "Check authentication status and return basic user info if logged in",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_login",
            "Login to Vaulta with email - sends OTP to email and returns temporary token",
            vec![ParameterSpec::required(
                "email",
                String,
                "User email address",
            )],
        ),
        ToolDescriptor::new(
            "vaulta_verify_otp",
            "Verify OTP code sent to email and get bearer access token",
            vec![
                ParameterSpec::required("otp", String, "OTP code from email"),
                ParameterSpec::required(
                    "token",
                    String,
                    "Temporary access_token received from login response",
                ),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_register",
            "Register a new user on Vaulta platform. After registration, user needs to login separately.",
            vec![
                ParameterSpec::required("first_name", String, "User first name"),
                ParameterSpec::required("last_name", String, "User last name"),
                ParameterSpec::required("email", String, "User email address"),
                ParameterSpec::required("phone", String, "User phone number"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_get_current_user",
            "Get current authenticated user account information and dashboard",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_create_account",
            "Create a new Vaulta account for holding funds",
            vec![
                ParameterSpec::required("name", String, "Account name (e.g., \"Main Trading Account\")"),
                ParameterSpec::required("currency", String, "Account currency (default: USD)"),
                ParameterSpec::optional("metadata", Object, "Optional metadata for custom tracking"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_get_all_accounts",
            "Get all accounts for the authenticated user with balances",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_update_account",
            "Update account details",
            vec![
                ParameterSpec::required("account_id", String, "Account ID to update"),
                ParameterSpec::required("name", String, "New account name"),
                ParameterSpec::required("currency", String, "Account currency"),
                ParameterSpec::optional("metadata", Object, "Optional metadata"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_delete_account",
            "Delete an account",
            vec![ParameterSpec::required(
                "account_id",
                String,
                "Account ID to delete",
            )],
        ),
        ToolDescriptor::new(
            "vaulta_create_payment",
            "Create a payment to a stablecoin address",
            vec![
                ParameterSpec::required("source_account_id", String, "Source account ID to debit from"),
                ParameterSpec::required("amount", String, "Payment amount (e.g., \"100.00\")"),
                ParameterSpec::required("currency", String, "Currency code (e.g., \"USD\")"),
                ParameterSpec::required(
                    "destination",
                    Object,
                    "Payment destination details: rail (e.g., \"stablecoin\"), network (e.g., \"solana\"), address",
                ),
                ParameterSpec::optional("description", String, "Optional payment description"),
                ParameterSpec::optional("client_reference", String, "Optional client reference ID"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_get_payment",
            "Get payment details by ID",
            vec![ParameterSpec::required("payment_id", String, "Payment ID")],
        ),
        ToolDescriptor::new(
            "vaulta_get_quote",
            "Get a trading quote for crypto/fiat pair",
            vec![
                ParameterSpec::required("pair", String, "Trading pair (e.g., \"BTC-USD\")"),
                ParameterSpec::required("side", String, "Trade side: buy or sell")
                    .with_allowed(vec!["buy".to_string(), "sell".to_string()]),
                ParameterSpec::optional("amount_crypto", Number, "Amount in crypto (if buying crypto)"),
                ParameterSpec::optional("amount_fiat", Number, "Amount in fiat (if selling crypto)"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_get_pairs",
            "Get all available trading pairs",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_get_cron_rates",
            "Get today's exchange rates",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_create_transaction",
            "Create a single transaction record",
            vec![
                ParameterSpec::required("amount", Number, "Transaction amount"),
                ParameterSpec::required("currency", String, "Currency code"),
                ParameterSpec::required(
                    "transaction_type",
                    String,
                    "Transaction type (e.g., \"deposit\", \"withdrawal\")",
                ),
                ParameterSpec::optional("status", String, "Transaction status (default: pending)"),
            ],
        ),
        ToolDescriptor::new(
            "vaulta_get_all_transactions",
            "Get all transactions for the user",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_get_transaction",
            "Get specific transaction by ID",
            vec![ParameterSpec::required(
                "transaction_id",
                String,
                "Transaction ID",
            )],
        ),
        ToolDescriptor::new(
            "vaulta_create_api_key",
            "Create a new API key for programmatic access",
            vec![],
        ),
        ToolDescriptor::new(
            "vaulta_get_api_keys",
            "Get all API keys for the user",
            vec![],
        ),
    ]
}
