//! Lazy OAuth token refresh
//!
//! `ensure_fresh` returns the account as-is while its access token has more
//! than 60 seconds of life left. Otherwise it exchanges the refresh token,
//! persists the new token set, and classifies failures: a 4xx that means the
//! refresh token is dead is permanent (the proxy deactivates the account),
//! anything else is transient and retried at most once per request.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::accounts::repository::TokenUpdate;
use crate::accounts::AccountsRepository;
use crate::config::Config;
use crate::crypto::TokenEncryptor;
use crate::db::models::Account;
use crate::usage::normalize_plan_type;

/// Access tokens this close to expiry count as expired.
const EXPIRY_SLACK_SECONDS: i64 = 60;

/// OAuth error codes that mean the refresh token will never work again.
const PERMANENT_REFRESH_ERRORS: &[&str] =
    &["invalid_grant", "unauthorized_client", "access_denied", "account_deactivated"];

#[derive(Debug, Clone, thiserror::Error)]
#[error("token refresh failed ({code})")]
pub struct RefreshError {
    pub code: String,
    pub permanent: bool,
}

impl RefreshError {
    fn transient(code: &str) -> Self {
        Self { code: code.to_string(), permanent: false }
    }

    fn permanent(code: &str) -> Self {
        Self { code: code.to_string(), permanent: true }
    }
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Clone)]
pub struct AuthManager {
    accounts: AccountsRepository,
    encryptor: Arc<TokenEncryptor>,
    http: reqwest::Client,
    config: Arc<Config>,
}

impl AuthManager {
    pub fn new(
        accounts: AccountsRepository,
        encryptor: Arc<TokenEncryptor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            accounts,
            encryptor,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Return an account whose access token is good for at least another
    /// minute, refreshing it first when needed (always when `force`).
    pub async fn ensure_fresh(
        &self,
        account: Account,
        force: bool,
    ) -> Result<Account, RefreshError> {
        if !force && !self.needs_refresh(&account) {
            return Ok(account);
        }
        self.refresh(account).await
    }

    fn needs_refresh(&self, account: &Account) -> bool {
        let Ok(access_token) = self.encryptor.decrypt(&account.access_token_encrypted) else {
            return true;
        };
        match jwt_exp(&access_token) {
            Some(exp) => exp <= Utc::now().timestamp() + EXPIRY_SLACK_SECONDS,
            // Tokens without a readable expiry refresh on a schedule handled
            // by the exp check of the replacement; treat as fresh here.
            None => false,
        }
    }

    #[tracing::instrument(skip(self, account), fields(account_id = %account.id))]
    async fn refresh(&self, account: Account) -> Result<Account, RefreshError> {
        let refresh_token = self
            .encryptor
            .decrypt(&account.refresh_token_encrypted)
            .map_err(|_| RefreshError::permanent("refresh_token_unreadable"))?;
        if refresh_token.is_empty() {
            return Err(RefreshError::permanent("refresh_token_missing"));
        }

        let url = format!("{}/oauth/token", self.config.auth_base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.config.token_refresh_timeout)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.config.oauth_client_id,
            }))
            .send()
            .await
            .map_err(|_| RefreshError::transient("auth_refresh_failed"))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let oauth_code = body
                .get("error")
                .and_then(|e| e.as_str().map(str::to_string).or_else(|| {
                    e.get("code").and_then(Value::as_str).map(str::to_string)
                }))
                .unwrap_or_default();
            let permanent = matches!(status, 400 | 401 | 403)
                && (oauth_code.is_empty() || PERMANENT_REFRESH_ERRORS.contains(&oauth_code.as_str()));
            tracing::warn!(status, code = %oauth_code, permanent, "Token refresh rejected");
            return if permanent {
                Err(RefreshError::permanent("refresh_token_invalid"))
            } else {
                Err(RefreshError::transient("auth_refresh_failed"))
            };
        }

        let tokens: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|_| RefreshError::transient("auth_refresh_failed"))?;

        self.persist(account, tokens).await
    }

    async fn persist(
        &self,
        account: Account,
        tokens: TokenRefreshResponse,
    ) -> Result<Account, RefreshError> {
        let encrypt = |value: &str| {
            self.encryptor
                .encrypt(value)
                .map_err(|_| RefreshError::transient("auth_refresh_failed"))
        };

        let access_token_encrypted = encrypt(&tokens.access_token)?;
        let refresh_token_encrypted = match &tokens.refresh_token {
            Some(refresh) => encrypt(refresh)?,
            None => account.refresh_token_encrypted.clone(),
        };
        let id_token_encrypted = match &tokens.id_token {
            Some(id_token) => encrypt(id_token)?,
            None => account.id_token_encrypted.clone(),
        };

        let identity = tokens.id_token.as_deref().map(parse_identity_claims).unwrap_or_default();
        let last_refresh = Utc::now();
        let update = TokenUpdate {
            access_token_encrypted: access_token_encrypted.clone(),
            refresh_token_encrypted: refresh_token_encrypted.clone(),
            id_token_encrypted: id_token_encrypted.clone(),
            last_refresh,
            plan_type: identity.plan_type.clone(),
            email: identity.email.clone(),
            chatgpt_account_id: identity.chatgpt_account_id.clone(),
        };
        self.accounts
            .update_tokens(&account.id, update)
            .await
            .map_err(|_| RefreshError::transient("auth_refresh_failed"))?;

        let mut refreshed = account;
        refreshed.access_token_encrypted = access_token_encrypted;
        refreshed.refresh_token_encrypted = refresh_token_encrypted;
        refreshed.id_token_encrypted = id_token_encrypted;
        refreshed.last_refresh = last_refresh;
        if let Some(plan) = identity.plan_type {
            refreshed.plan_type = plan;
        }
        if let Some(email) = identity.email {
            refreshed.email = email;
        }
        if let Some(account_id) = identity.chatgpt_account_id {
            refreshed.chatgpt_account_id = Some(account_id);
        }
        Ok(refreshed)
    }
}

#[derive(Debug, Default)]
struct IdentityClaims {
    email: Option<String>,
    plan_type: Option<String>,
    chatgpt_account_id: Option<String>,
}

/// Identity fields carried in the id token, when present.
fn parse_identity_claims(id_token: &str) -> IdentityClaims {
    let Some(claims) = jwt_claims(id_token) else {
        return IdentityClaims::default();
    };
    let auth = claims.get("https://api.openai.com/auth");
    IdentityClaims {
        email: claims.get("email").and_then(Value::as_str).map(str::to_string),
        plan_type: auth
            .and_then(|a| a.get("chatgpt_plan_type"))
            .and_then(Value::as_str)
            .and_then(|plan| normalize_plan_type(Some(plan))),
        chatgpt_account_id: auth
            .and_then(|a| a.get("chatgpt_account_id"))
            .or_else(|| claims.get("chatgpt_account_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn jwt_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// `exp` claim of a JWT, without signature verification (the upstream is the
/// authority; we only schedule refreshes with it).
fn jwt_exp(token: &str) -> Option<i64> {
    jwt_claims(token)?.get("exp")?.as_i64()
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(claims: &Value) -> String {
    let body = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(claims).unwrap());
    format!("header.{body}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jwt_exp_round_trip() {
        let token = encode_test_jwt(&json!({"exp": 1_900_000_000}));
        assert_eq!(jwt_exp(&token), Some(1_900_000_000));
        assert_eq!(jwt_exp("not-a-jwt"), None);
        assert_eq!(jwt_exp("a.!!!.c"), None);
    }

    #[test]
    fn test_parse_identity_claims() {
        let token = encode_test_jwt(&json!({
            "email": "a@example.com",
            "https://api.openai.com/auth": {
                "chatgpt_plan_type": "Plus",
                "chatgpt_account_id": "acc_upstream",
            },
        }));
        let identity = parse_identity_claims(&token);
        assert_eq!(identity.email.as_deref(), Some("a@example.com"));
        assert_eq!(identity.plan_type.as_deref(), Some("plus"));
        assert_eq!(identity.chatgpt_account_id.as_deref(), Some("acc_upstream"));
    }

    #[tokio::test]
    async fn test_ensure_fresh_skips_refresh_for_live_token() {
        let db = crate::db::memory_database().await.unwrap();
        let accounts = AccountsRepository::new(&db);
        let encryptor = Arc::new(crate::crypto::test_encryptor());
        std::env::remove_var("CODEX_LB_ACCOUNTS_DATABASE_URL");
        let config = Arc::new(Config::from_env().unwrap());

        let live_token = encode_test_jwt(&json!({"exp": Utc::now().timestamp() + 3600}));
        let mut account = crate::accounts::repository::test_account("acc_a", "a@example.com", "plus");
        account.access_token_encrypted = encryptor.encrypt(&live_token).unwrap();
        accounts.upsert(&account).await.unwrap();

        let manager = AuthManager::new(accounts, encryptor, config);
        let result = manager.ensure_fresh(account.clone(), false).await.unwrap();
        assert_eq!(result.access_token_encrypted, account.access_token_encrypted);
    }
}
