use base64::Engine as _;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::OAuthSettings;
use crate::error::AuthError;
use crate::storage::{EXPIRY_SAFETY_WINDOW_SECS, TokenStore, ensure_private_dir};

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Endpoints and client identity for the provider's OAuth server.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: String,
}

impl OAuthEndpoints {
    pub fn from_settings(settings: &OAuthSettings) -> Self {
        Self {
            authorize_url: format!(
                "{}/oauth/authorize",
                settings.authorize_base.trim_end_matches('/')
            ),
            token_url: format!(
                "{}/v1/oauth/token",
                settings.token_base.trim_end_matches('/')
            ),
            client_id: settings.client_id.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            scopes: settings.scopes.clone(),
        }
    }
}

/// PKCE material for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceState {
    pub code_verifier: String,
    pub state: String,
}

/// OAuth token response from the provider
#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Generate a (verifier, challenge) pair: 32 random bytes base64url-encoded,
/// challenge is base64url(SHA-256(verifier)). No padding on either.
pub fn generate_pkce() -> (String, String) {
    let mut verifier_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut verifier_bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}

pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Split a pasted `code#state` value. Only the first `#` separates.
pub fn split_code_and_state(raw: &str) -> (&str, Option<&str>) {
    match raw.trim().split_once('#') {
        Some((code, state)) if !state.is_empty() => (code, Some(state)),
        Some((code, _)) => (code, None),
        None => (raw.trim(), None),
    }
}

/// PKCE authorization-code and refresh-token flows against the provider,
/// persisting results through a [`TokenStore`].
pub struct OAuthClient {
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    store: TokenStore,
    pkce_path: PathBuf,
    pkce: Mutex<Option<PkceState>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl OAuthClient {
    pub fn new(
        endpoints: OAuthEndpoints,
        store: TokenStore,
        pkce_path: PathBuf,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_http_client(http, endpoints, store, pkce_path))
    }

    pub fn with_http_client(
        http: reqwest::Client,
        endpoints: OAuthEndpoints,
        store: TokenStore,
        pkce_path: PathBuf,
    ) -> Self {
        Self {
            http,
            endpoints,
            store,
            pkce_path,
            pkce: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Start a login attempt: generate PKCE material, persist it so the
    /// exchange can happen in a later process, and build the authorize URL.
    pub fn build_authorization_url(&self) -> Result<(String, PkceState), AuthError> {
        let (verifier, challenge) = generate_pkce();
        // The provider expects `state` to echo the PKCE verifier. This is a
        // compatibility requirement of its authorize page; replacing it with an
        // independent random value breaks the login.
        let pkce = PkceState {
            state: verifier.clone(),
            code_verifier: verifier,
        };
        self.save_pkce(&pkce)?;
        self.set_pkce(Some(pkce.clone()));

        let mut url = url::Url::parse(&self.endpoints.authorize_url)
            .map_err(|e| AuthError::InvalidTokenResponse(format!("bad authorize url: {}", e)))?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("code", "true");
            qp.append_pair("client_id", &self.endpoints.client_id);
            qp.append_pair("response_type", "code");
            qp.append_pair("redirect_uri", &self.endpoints.redirect_uri);
            qp.append_pair("scope", &self.endpoints.scopes);
            qp.append_pair("code_challenge", &challenge);
            qp.append_pair("code_challenge_method", "S256");
            qp.append_pair("state", &pkce.state);
        }
        Ok((url.to_string(), pkce))
    }

    /// Redeem a pasted `code#state` for tokens. The PKCE state is consumed on
    /// success, so a second exchange needs a fresh login.
    pub async fn exchange_code(&self, raw_code: &str) -> Result<(), AuthError> {
        let (code, state) = split_code_and_state(raw_code);
        if code.is_empty() {
            return Err(AuthError::EmptyCode);
        }

        let pkce = self
            .current_pkce()
            .or_else(|| self.load_pkce())
            .ok_or(AuthError::MissingVerifier)?;
        let state = state.unwrap_or(&pkce.state);

        let body = json!({
            "code": code,
            "state": state,
            "grant_type": "authorization_code",
            "client_id": self.endpoints.client_id,
            "redirect_uri": self.endpoints.redirect_uri,
            "code_verifier": pkce.code_verifier,
        });
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            error!(status = status.as_u16(), "code exchange failed");
            return Err(AuthError::ExchangeFailed {
                status: status.as_u16(),
                body: text,
            });
        }

        let (access, refresh, expires_in) = parse_token_response(&text)?;
        self.store.save(&access, &refresh, expires_in)?;

        self.clear_pkce();
        info!("OAuth code exchange succeeded");
        Ok(())
    }

    /// One refresh round trip. Distinguishes provider rejection
    /// ([`AuthError::RefreshFailed`]) from network faults
    /// ([`AuthError::Network`]). Never retries.
    pub async fn try_refresh(&self) -> Result<(), AuthError> {
        self.refresh_access_token().await.map(|_| ())
    }

    async fn refresh_access_token(&self) -> Result<String, AuthError> {
        let refresh_token = self.store.refresh_token().ok_or(AuthError::NoTokens)?;

        info!("Attempting to refresh OAuth tokens");
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.endpoints.client_id,
        });
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            return Err(AuthError::RefreshFailed {
                status: status.as_u16(),
                body: text,
            });
        }

        // Refresh tokens rotate: the returned pair replaces the stored one.
        let (access, refresh, expires_in) = parse_token_response(&text)?;
        self.store.save(&access, &refresh, expires_in)?;
        if expires_in <= EXPIRY_SAFETY_WINDOW_SECS {
            warn!(expires_in, "Refreshed token is already inside the expiry window");
        }
        info!("Successfully refreshed OAuth tokens");
        Ok(access)
    }

    /// Refresh and hand back the new access token, even one too short-lived
    /// for the store to report as valid.
    pub async fn refresh(&self) -> Option<String> {
        match self.refresh_access_token().await {
            Ok(token) => Some(token),
            Err(AuthError::NoTokens) => {
                warn!("No refresh token available for refresh");
                None
            }
            Err(e) => {
                error!("Token refresh failed: {}", e);
                None
            }
        }
    }

    /// The single chokepoint for outbound calls: the stored token if still
    /// valid, otherwise the result of exactly one refresh.
    pub async fn valid_token(&self) -> Option<String> {
        self.require_token().await.ok()
    }

    /// Like [`valid_token`](Self::valid_token) but says why there is none:
    /// [`AuthError::NoTokens`] before any login, [`AuthError::Expired`] when
    /// the provider refused the refresh, [`AuthError::Network`] when it could
    /// not be reached.
    pub async fn require_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.store.access_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another request may have refreshed while we waited.
        if let Some(token) = self.store.access_token() {
            return Ok(token);
        }

        info!("Token expired, attempting automatic refresh");
        match self.refresh_access_token().await {
            Ok(token) => Ok(token),
            Err(AuthError::NoTokens) => {
                warn!("No tokens stored; login required");
                Err(AuthError::NoTokens)
            }
            Err(e) if e.is_transient() => {
                error!("Failed to refresh token automatically: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Failed to refresh token automatically: {}", e);
                Err(AuthError::Expired)
            }
        }
    }

    /// Refresh after the upstream rejected `rejected_token`, unless another
    /// request already replaced it. Returns the token to retry with.
    pub async fn refresh_after_rejection(&self, rejected_token: &str) -> Option<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.store.access_token()
            && token != rejected_token
        {
            debug!("token already rotated by a concurrent refresh");
            return Some(token);
        }
        self.refresh().await
    }

    /// Drop any pending login attempt, e.g. after a failed exchange.
    pub fn invalidate_pkce(&self) {
        self.clear_pkce();
    }

    pub fn logout(&self) -> Result<(), AuthError> {
        self.clear_pkce();
        self.store.clear()?;
        Ok(())
    }

    fn current_pkce(&self) -> Option<PkceState> {
        self.pkce.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_pkce(&self, value: Option<PkceState>) {
        if let Ok(mut guard) = self.pkce.lock() {
            *guard = value;
        }
    }

    fn save_pkce(&self, pkce: &PkceState) -> Result<(), AuthError> {
        let contents = serde_json::to_string(pkce)
            .map_err(|e| AuthError::Storage(std::io::Error::other(e)))?;
        let mut opts = fs::OpenOptions::new();
        opts.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        if let Some(parent) = self.pkce_path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_private_dir(parent)?;
        }
        use std::io::Write;
        let mut f = opts.open(&self.pkce_path)?;
        f.write_all(contents.as_bytes())?;
        Ok(())
    }

    fn load_pkce(&self) -> Option<PkceState> {
        let contents = fs::read_to_string(&self.pkce_path).ok()?;
        let pkce: PkceState = serde_json::from_str(&contents).ok()?;
        self.set_pkce(Some(pkce.clone()));
        Some(pkce)
    }

    fn clear_pkce(&self) {
        self.set_pkce(None);
        if let Err(e) = fs::remove_file(&self.pkce_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove PKCE scratch file: {}", e);
        }
    }
}

fn parse_token_response(body: &str) -> Result<(String, String, i64), AuthError> {
    let parsed: OAuthTokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;
    let access = parsed
        .access_token
        .ok_or_else(|| AuthError::InvalidTokenResponse("missing access_token".to_string()))?;
    let refresh = parsed
        .refresh_token
        .ok_or_else(|| AuthError::InvalidTokenResponse("missing refresh_token".to_string()))?;
    Ok((access, refresh, parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)))
}
