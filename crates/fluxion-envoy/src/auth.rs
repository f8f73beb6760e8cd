// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Token acquisition and session upkeep
//!
//! The Envoy accepts either a bearer JWT issued through Enlighten/Entrez or a
//! session cookie handed out by `/auth/check_jwt` for that JWT. The
//! [`Authenticator`] keeps exactly one of those active and swaps the pair
//! atomically so concurrent requests (refresh cycle and meter stream) always
//! see a consistent snapshot.

use crate::config::{AuthFlow, EnvoyConfig};
use crate::endpoints::paths;
use crate::errors::{EnvoyError, EnvoyResult};
use crate::storage::{TokenStore, load_token, save_token};
use crate::transport::build_http_client;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CODE_VERIFIER_LEN: usize = 40;

/// Header/cookie pair attached to every device request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub bearer: Option<String>,
    pub cookies: Vec<(String, String)>,
}

impl SessionCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            cookies: Vec::new(),
        }
    }

    /// Builds the pair from check_jwt cookies: a session cookie replaces the bearer header.
    pub fn from_cookies(token: &str, cookies: Vec<(String, String)>) -> Self {
        let has_session = cookies
            .iter()
            .any(|(name, _)| name.to_lowercase().contains("session"));
        Self {
            bearer: (!has_session).then(|| token.to_string()),
            cookies,
        }
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenTier {
    Owner,
    Installer,
    #[default]
    Unknown,
}

impl TokenTier {
    fn from_claim(claim: Option<&str>) -> Self {
        match claim {
            Some("owner") => Self::Owner,
            Some("installer") => Self::Installer,
            _ => Self::Unknown,
        }
    }
}

/// Unverified JWT claims.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    #[serde(rename = "enphaseUser", default)]
    pub enphase_user: Option<String>,
    pub exp: i64,
}

impl TokenClaims {
    /// Reads the payload segment without checking the signature.
    pub fn decode(token: &str) -> EnvoyResult<Self> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| EnvoyError::InvalidToken("token is not a JWT".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| EnvoyError::InvalidToken(format!("payload is not base64url: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EnvoyError::InvalidToken(format!("payload is not valid claims: {e}")))
    }

    pub fn tier(&self) -> TokenTier {
        TokenTier::from_claim(self.enphase_user.as_deref())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Valid while `now < exp - buffer`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer = i64::try_from(buffer.as_secs()).unwrap_or(i64::MAX);
        now.timestamp() >= self.exp.saturating_sub(buffer)
    }
}

/// Session operations the transport needs when the Envoy answers 401.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    fn credentials(&self) -> Arc<SessionCredentials>;

    /// Revalidate the current token at the Envoy; `false` when it was refused.
    async fn refresh_session(&self) -> EnvoyResult<bool>;

    /// Obtain a brand new token and session.
    async fn reauthenticate(&self) -> EnvoyResult<()>;

    /// Make sure a token and a session exist before a long-lived request.
    async fn establish_session(&self) -> EnvoyResult<()>;
}

pub fn code_verifier() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_VERIFIER_LEN)
        .map(char::from)
        .collect()
}

/// base64url(SHA-256(verifier)) without padding.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn authorization_code(location: &str) -> EnvoyResult<String> {
    let parsed = url::Url::parse(location)
        .or_else(|_| url::Url::parse("https://localhost/").and_then(|base| base.join(location)))
        .map_err(|e| {
            EnvoyError::AuthenticationFailed(format!("Invalid redirect location '{location}': {e}"))
        })?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            EnvoyError::AuthenticationFailed("Redirect did not carry an authorization code".to_string())
        })
}

#[derive(Debug, Clone)]
struct AuthSettings {
    flow: AuthFlow,
    username: String,
    password: String,
    serial: String,
    device_base_url: String,
    entrez_url: String,
    enlighten_url: String,
    refresh_buffer: Duration,
}

impl AuthSettings {
    fn from_config(config: &EnvoyConfig) -> Self {
        Self {
            flow: config.auth_flow,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
            serial: config.serial.clone().unwrap_or_default(),
            device_base_url: config.device_base_url().trim_end_matches('/').to_string(),
            entrez_url: config.entrez_url.trim_end_matches('/').to_string(),
            enlighten_url: config.enlighten_url.trim_end_matches('/').to_string(),
            refresh_buffer: Duration::from_secs(config.token_refresh_buffer_secs),
        }
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty() && !self.serial.is_empty()
    }
}

/// Owns the token lifecycle for one Envoy.
pub struct Authenticator {
    client: Client,
    settings: AuthSettings,
    store: Arc<dyn TokenStore>,
    token: RwLock<Option<String>>,
    store_loaded: AtomicBool,
    tier: RwLock<TokenTier>,
    installer_disabled: AtomicBool,
    credentials: RwLock<Arc<SessionCredentials>>,
    acquire_lock: Mutex<()>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("flow", &self.settings.flow)
            .field("device", &self.settings.device_base_url)
            .field("tier", &*self.tier.read())
            .field(
                "installer_disabled",
                &self.installer_disabled.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(config: &EnvoyConfig, store: Arc<dyn TokenStore>) -> EnvoyResult<Self> {
        Ok(Self {
            client: build_http_client(config.request_timeout())?,
            settings: AuthSettings::from_config(config),
            store,
            token: RwLock::new(None),
            store_loaded: AtomicBool::new(false),
            tier: RwLock::new(TokenTier::Unknown),
            installer_disabled: AtomicBool::new(config.disable_installer_account_use),
            credentials: RwLock::new(Arc::new(SessionCredentials::default())),
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn tier(&self) -> TokenTier {
        *self.tier.read()
    }

    /// Installer endpoints may be used: installer token and not downgraded.
    pub fn installer_enabled(&self) -> bool {
        self.tier() == TokenTier::Installer && !self.installer_disabled.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Make sure a valid token is present and the session is established.
    pub async fn ensure_authenticated(&self) -> EnvoyResult<()> {
        let _guard = self.acquire_lock.lock().await;
        self.load_stored_token().await?;

        let Some(token) = self.token() else {
            debug!("🔑 [AUTH] No token stored, acquiring a new one");
            return self.acquire_token_locked().await;
        };

        match TokenClaims::decode(&token) {
            Ok(claims) if !claims.is_expired_at(Utc::now(), self.settings.refresh_buffer) => {
                self.apply_claims(&claims);
                if !self.refresh_session_with(&token).await? {
                    warn!("⚠️ [AUTH] Envoy refused the stored token, will reacquire on 401");
                }
                Ok(())
            }
            Ok(claims) => {
                info!(
                    "🔑 [AUTH] Token expired at {:?}, acquiring a new one",
                    claims.expires_at()
                );
                self.acquire_token_locked().await
            }
            Err(e) => {
                warn!("⚠️ [AUTH] Stored token unreadable ({}), acquiring a new one", e);
                self.acquire_token_locked().await
            }
        }
    }

    async fn load_stored_token(&self) -> EnvoyResult<()> {
        if self.store_loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(token) = load_token(self.store.as_ref()).await? {
            debug!("🔑 [AUTH] Loaded token from store");
            *self.token.write() = Some(token);
        }
        Ok(())
    }

    async fn acquire_token_locked(&self) -> EnvoyResult<()> {
        if !self.settings.has_credentials() {
            return Err(EnvoyError::AuthenticationFailed(
                "No valid token and no Enlighten username/password/serial configured".to_string(),
            ));
        }

        let token = match self.settings.flow {
            AuthFlow::Gateway => self.fetch_gateway_token().await?,
            AuthFlow::Owner => self.fetch_owner_token().await?,
        };

        let claims = TokenClaims::decode(&token)?;
        if claims.is_expired_at(Utc::now(), self.settings.refresh_buffer) {
            return Err(EnvoyError::AuthenticationFailed(
                "Just received token already expired".to_string(),
            ));
        }
        self.apply_claims(&claims);
        info!("🔑 [AUTH] Token type: {:?}", claims.tier());

        *self.token.write() = Some(token.clone());
        save_token(self.store.as_ref(), &token).await?;

        if !self.refresh_session_with(&token).await? {
            warn!("⚠️ [AUTH] Envoy did not accept the freshly issued token");
        }
        Ok(())
    }

    fn apply_claims(&self, claims: &TokenClaims) {
        let tier = claims.tier();
        *self.tier.write() = tier;
        if tier != TokenTier::Installer && !self.installer_disabled.swap(true, Ordering::SeqCst) {
            warn!(
                "⚠️ [AUTH] Token is of type {:?}, disabling installer account usage",
                tier
            );
        }
    }

    /// Code-challenge login at Entrez, code exchanged at the Envoy.
    async fn fetch_gateway_token(&self) -> EnvoyResult<String> {
        let verifier = code_verifier();
        let challenge = code_challenge(&verifier);
        let redirect_uri = format!("{}/auth/callback", self.settings.device_base_url);
        let form = [
            ("username", self.settings.username.as_str()),
            ("password", self.settings.password.as_str()),
            ("codeChallenge", challenge.as_str()),
            ("redirectUri", redirect_uri.as_str()),
            ("client", "envoy-ui"),
            ("clientId", "envoy-ui-client"),
            ("authFlow", "oauth"),
            ("serialNum", self.settings.serial.as_str()),
            ("granttype", "authorize"),
            ("state", ""),
            ("invalidSerialNum", ""),
        ];

        let login_url = format!("{}/login", self.settings.entrez_url);
        debug!("🔑 [AUTH] Authorizing at {}", login_url);
        let response = self.client.post(&login_url).form(&form).send().await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(EnvoyError::AuthenticationFailed(format!(
                "Could not login via Enlighten (HTTP {status})"
            )));
        }
        if status != StatusCode::FOUND {
            return Err(EnvoyError::AuthenticationFailed(format!(
                "Login did not succeed (HTTP {status})"
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                EnvoyError::AuthenticationFailed("Login redirect has no location".to_string())
            })?;
        let code = authorization_code(location)?;

        let body = json!({
            "client_id": "envoy-ui-1",
            "code": code,
            "code_verifier": verifier,
            "grant_type": "authorization_code",
            "redirect_uri": redirect_uri,
        });
        let jwt_url = format!("{}{}", self.settings.device_base_url, paths::AUTH_GET_JWT);
        let response = self.client.post(&jwt_url).json(&body).send().await?;

        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            return Err(EnvoyError::ApiError {
                status,
                message: format!(
                    "Could not fetch access token from Envoy: {}",
                    response.text().await.unwrap_or_default()
                ),
            });
        }

        let payload: Value = response.json().await?;
        payload
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EnvoyError::InvalidToken("get_jwt response has no access_token".to_string()))
    }

    /// Enlighten owner login followed by an Entrez token request.
    async fn fetch_owner_token(&self) -> EnvoyResult<String> {
        let login_url = format!("{}/login/login.json", self.settings.enlighten_url);
        debug!("🔑 [AUTH] Owner login at {}", login_url);
        let response = self
            .client
            .post(&login_url)
            .form(&[
                ("user[email]", self.settings.username.as_str()),
                ("user[password]", self.settings.password.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EnvoyError::AuthenticationFailed(format!(
                "Enlighten login failed (HTTP {})",
                response.status()
            )));
        }

        let login: Value = response.json().await?;
        let session_id = login
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EnvoyError::AuthenticationFailed("Enlighten login returned no session_id".to_string())
            })?;

        let tokens_url = format!("{}/tokens", self.settings.entrez_url);
        let response = self
            .client
            .post(&tokens_url)
            .json(&json!({
                "session_id": session_id,
                "serial_num": self.settings.serial,
                "username": self.settings.username,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EnvoyError::AuthenticationFailed(format!(
                "Entrez token request failed (HTTP {})",
                response.status()
            )));
        }

        let token = response.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(EnvoyError::AuthenticationFailed(
                "Entrez returned an empty token".to_string(),
            ));
        }
        Ok(token)
    }

    async fn refresh_session_with(&self, token: &str) -> EnvoyResult<bool> {
        let url = format!("{}{}", self.settings.device_base_url, paths::AUTH_CHECK_JWT);
        debug!("🔑 [AUTH] Validating token at {}", url);
        let response = self.client.post(&url).bearer_auth(token).send().await?;

        if response.status() != StatusCode::OK {
            debug!("🔑 [AUTH] check_jwt answered {}", response.status());
            *self.credentials.write() = Arc::new(SessionCredentials::bearer(token));
            return Ok(false);
        }

        let cookies: Vec<(String, String)> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let credentials = SessionCredentials::from_cookies(token, cookies);
        if credentials.bearer.is_none() {
            debug!("🔑 [AUTH] Session cookie received, dropping bearer header");
        }
        *self.credentials.write() = Arc::new(credentials);
        Ok(true)
    }
}

#[async_trait]
impl SessionAuthority for Authenticator {
    fn credentials(&self) -> Arc<SessionCredentials> {
        Arc::clone(&self.credentials.read())
    }

    async fn refresh_session(&self) -> EnvoyResult<bool> {
        let _guard = self.acquire_lock.lock().await;
        match self.token() {
            Some(token) => self.refresh_session_with(&token).await,
            None => Ok(false),
        }
    }

    async fn reauthenticate(&self) -> EnvoyResult<()> {
        let _guard = self.acquire_lock.lock().await;
        self.acquire_token_locked().await
    }

    async fn establish_session(&self) -> EnvoyResult<()> {
        self.ensure_authenticated().await
    }
}
