//! Omada controller OpenAPI access: client-credential and refresh-token
//! exchange, plus site lookup.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize};
use time::{Duration, OffsetDateTime};

use crate::error::{ConfigError, RemoteAccessError};

/// Refresh tokens live 14 days on the controller; stop using them a day early.
pub const REFRESH_TOKEN_LIFETIME: Duration = Duration::days(14);
pub const REFRESH_TOKEN_SAFETY_BUFFER: Duration = Duration::days(1);

const TOKEN_ENDPOINT: &str = "omada token endpoint";
const SITES_ENDPOINT: &str = "omada site list";

#[derive(Clone)]
pub struct OmadaSettings {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub omadac_id: String,
    pub accept_invalid_certs: bool,
    /// Upper bound on any single controller request.
    pub request_timeout: std::time::Duration,
}

impl std::fmt::Debug for OmadaSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OmadaSettings")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("omadac_id", &self.omadac_id)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl OmadaSettings {
    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    fn token_url(&self) -> String {
        format!("{}/openapi/authorize/token", self.base())
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/openapi/v1/{}{}", self.base(), self.omadac_id, path)
    }
}

/// Tokens for one controller. Absent until the first exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub access_expiry: Option<OffsetDateTime>,
    pub refresh_token: Option<String>,
    pub refresh_expiry: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unauthenticated,
    Authenticated,
    AccessExpired,
    FullyExpired,
}

impl TokenState {
    pub fn access_valid(&self, now: OffsetDateTime) -> bool {
        self.access_token.is_some() && self.access_expiry.is_some_and(|exp| now < exp)
    }

    pub fn refresh_valid(&self, now: OffsetDateTime) -> bool {
        self.refresh_token.is_some() && self.refresh_expiry.is_some_and(|exp| now < exp)
    }

    pub fn phase(&self, now: OffsetDateTime) -> AuthPhase {
        if self.access_token.is_none() && self.refresh_token.is_none() {
            AuthPhase::Unauthenticated
        } else if self.access_valid(now) {
            AuthPhase::Authenticated
        } else if self.refresh_valid(now) {
            AuthPhase::AccessExpired
        } else {
            AuthPhase::FullyExpired
        }
    }
}

/// Every OpenAPI reply is wrapped as `{errorCode, msg, result}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope<T> {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    msg: Option<String>,
    result: Option<T>,
}

pub(crate) async fn read_result<T: DeserializeOwned>(
    resp: reqwest::Response,
    endpoint: &str,
) -> Result<T, RemoteAccessError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteAccessError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let envelope: ApiEnvelope<T> = resp
        .json()
        .await
        .map_err(|e| RemoteAccessError::malformed(endpoint, e))?;

    if envelope.error_code != 0 {
        return Err(RemoteAccessError::Rejected {
            endpoint: endpoint.to_string(),
            code: envelope.error_code,
            message: envelope.msg.unwrap_or_default(),
        });
    }

    envelope
        .result
        .ok_or_else(|| RemoteAccessError::malformed(endpoint, "missing result"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenGrant {
    /// When the granted access token lapses. A lifetime that is not positive
    /// or does not fit in a timestamp is a malformed grant.
    fn access_expiry(&self, now: OffsetDateTime) -> Result<OffsetDateTime, RemoteAccessError> {
        if self.expires_in <= 0 {
            return Err(RemoteAccessError::malformed(
                TOKEN_ENDPOINT,
                format!("non-positive expiresIn {}", self.expires_in),
            ));
        }
        now.checked_add(Duration::seconds(self.expires_in)).ok_or_else(|| {
            RemoteAccessError::malformed(TOKEN_ENDPOINT, format!("expiresIn {} is out of range", self.expires_in))
        })
    }
}

/// The controller no longer accepts the access token it issued.
pub(crate) fn is_unauthorized(e: &RemoteAccessError) -> bool {
    matches!(e, RemoteAccessError::Status { status: 401, .. })
}

#[derive(Debug, Deserialize)]
struct SitePage {
    data: Vec<Site>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Site {
    site_id: String,
}

/// A rejected exchange means the credentials are no good. Transport failures
/// stay retryable.
fn authentication_failure(e: RemoteAccessError) -> RemoteAccessError {
    match e {
        RemoteAccessError::Http(_) | RemoteAccessError::Io(_) => e,
        other => RemoteAccessError::Authentication(other.to_string()),
    }
}

pub struct TokenManager {
    http: reqwest::Client,
    settings: OmadaSettings,
    state: TokenState,
    site_id: Option<String>,
}

impl TokenManager {
    pub fn new(settings: OmadaSettings) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build omada http client: {e}")))?;

        Ok(Self {
            http,
            settings,
            state: TokenState::default(),
            site_id: None,
        })
    }

    pub fn settings(&self) -> &OmadaSettings {
        &self.settings
    }

    pub fn state(&self) -> &TokenState {
        &self.state
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Forget the access token so the next `get_headers` refreshes it. The
    /// refresh token is kept.
    pub fn invalidate_access_token(&mut self) {
        self.state.access_token = None;
        self.state.access_expiry = None;
    }

    /// Request headers carrying a valid access token, exchanging tokens first
    /// if needed.
    pub async fn get_headers(&mut self) -> Result<HeaderMap, RemoteAccessError> {
        match self.state.phase(OffsetDateTime::now_utc()) {
            AuthPhase::Authenticated => {}
            AuthPhase::AccessExpired => self.refresh_access_token().await?,
            AuthPhase::Unauthenticated | AuthPhase::FullyExpired => self.get_new_tokens().await?,
        }

        let token = self
            .state
            .access_token
            .as_deref()
            .ok_or_else(|| RemoteAccessError::Authentication("no access token after exchange".to_string()))?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("AccessToken={token}"))
            .map_err(|e| RemoteAccessError::malformed(TOKEN_ENDPOINT, e))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Client-credential exchange. Replaces both tokens.
    async fn get_new_tokens(&mut self) -> Result<(), RemoteAccessError> {
        metrics::counter!("omada_token_exchanges_total", "grant" => "client_credentials").increment(1);

        let body = serde_json::json!({
            "client_id": self.settings.client_id,
            "client_secret": self.settings.client_secret,
            "omadacId": self.settings.omadac_id,
        });
        let resp = self
            .http
            .post(self.settings.token_url())
            .query(&[("grant_type", "client_credentials")])
            .json(&body)
            .send()
            .await?;

        let grant: TokenGrant = read_result(resp, TOKEN_ENDPOINT).await.map_err(authentication_failure)?;
        let now = OffsetDateTime::now_utc();
        let access_expiry = grant.access_expiry(now).map_err(authentication_failure)?;
        let refresh_token = grant
            .refresh_token
            .ok_or_else(|| RemoteAccessError::Authentication("token grant carried no refresh token".to_string()))?;

        self.state = TokenState {
            access_token: Some(grant.access_token),
            access_expiry: Some(access_expiry),
            refresh_token: Some(refresh_token),
            refresh_expiry: Some(now + REFRESH_TOKEN_LIFETIME - REFRESH_TOKEN_SAFETY_BUFFER),
        };
        tracing::info!(expires_in = grant.expires_in, "obtained new omada access token");
        Ok(())
    }

    /// Refresh-token exchange. Only the access token changes; on any failure
    /// fall back to a single client-credential exchange.
    async fn refresh_access_token(&mut self) -> Result<(), RemoteAccessError> {
        let refreshed = self.refresh_exchange().await.and_then(|grant| {
            let expiry = grant.access_expiry(OffsetDateTime::now_utc())?;
            Ok((grant, expiry))
        });
        match refreshed {
            Ok((grant, expiry)) => {
                self.state.access_token = Some(grant.access_token);
                self.state.access_expiry = Some(expiry);
                tracing::debug!(expires_in = grant.expires_in, "refreshed omada access token");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "omada token refresh failed, re-authenticating");
                self.get_new_tokens().await
            }
        }
    }

    async fn refresh_exchange(&self) -> Result<TokenGrant, RemoteAccessError> {
        metrics::counter!("omada_token_exchanges_total", "grant" => "refresh_token").increment(1);

        let refresh_token = self.state.refresh_token.as_deref().unwrap_or_default();
        let resp = self
            .http
            .post(self.settings.token_url())
            .query(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        read_result(resp, TOKEN_ENDPOINT).await
    }

    /// First site on the controller. Looked up once, then memoized.
    pub async fn get_site_id(&mut self) -> Result<String, RemoteAccessError> {
        if let Some(id) = &self.site_id {
            return Ok(id.clone());
        }

        let headers = self.get_headers().await?;
        let resp = self
            .http
            .get(self.settings.api_url("/sites"))
            .query(&[("pageSize", "1"), ("page", "1")])
            .headers(headers)
            .send()
            .await?;

        let page: SitePage = match read_result(resp, SITES_ENDPOINT).await {
            Ok(page) => page,
            Err(e) => {
                if is_unauthorized(&e) {
                    self.invalidate_access_token();
                }
                return Err(e);
            }
        };
        let site = page
            .data
            .into_iter()
            .next()
            .ok_or_else(|| RemoteAccessError::malformed(SITES_ENDPOINT, "controller has no sites"))?;

        self.site_id = Some(site.site_id.clone());
        Ok(site.site_id)
    }
}
