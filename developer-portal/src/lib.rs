// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for Apple's Developer Portal web services.
//!
//! Unlike the App Store Connect API, the portal has no token auth: it
//! wants a browser-grade session established through SRP-6a + two-factor
//! against `idmsa.apple.com`, then drives everything off cookies plus a
//! CSRF token pair. This crate owns that session (see [session]) and
//! exposes typed operations over the portal's resource graph: teams,
//! certificates, bundle identifiers and their capabilities, app groups,
//! iCloud containers, devices and provisioning profiles.
//!
//! One [DeveloperPortalClient] per run; no process-global state.

pub mod auth;
pub mod certs_api;
pub mod device_api;
pub mod group_api;
pub mod identifier_api;
pub mod profile_api;
pub mod session;
pub mod srp;
pub mod team_api;

pub use crate::{
    auth::{TwoFactorMode, TwoFactorPrompt},
    certs_api::{Certificate, CertificateKind},
    device_api::Device,
    group_api::{AppGroup, CloudContainer},
    identifier_api::{AvailableCapability, BundleIdentifier, CapabilityRelationships},
    profile_api::{ProfileKind, ProvisioningProfile},
    session::{SessionData, SessionStore},
    team_api::Team,
};

use {
    log::{debug, warn},
    rand::Rng,
    serde_json::Value,
    std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Mutex,
        },
        time::Duration,
    },
};

/// Transient-failure retry policy: 500ms base, doubling, ±25% jitter,
/// five attempts total.
const RETRY_BASE_MS: u64 = 500;
const RETRY_MAX_ATTEMPTS: u32 = 5;
/// A 429 sleeps this long and is retried exactly once.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed JSON from portal: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SRP failure: {0}")]
    Srp(#[from] srp::SrpError),

    #[error("Apple ID or password rejected")]
    BadCredentials,

    #[error("two-factor verification failed: {0}")]
    TwoFactorFailed(String),

    #[error("account is locked out of the portal")]
    SessionLockedOut,

    #[error("session is already in use (lock file {0} exists)")]
    SessionLocked(String),

    #[error("apple id belongs to multiple teams; pass an explicit team id: {0:?}")]
    TeamAmbiguous(Vec<String>),

    #[error("re-authentication failed; portal still answers unauthorized")]
    Unauthorized,

    #[error("identifier conflict on the portal: {0}")]
    IdentifierConflict(String),

    #[error("profile creation failed: {0}")]
    ProfileCreationFailed(String),

    #[error("portal unavailable after {RETRY_MAX_ATTEMPTS} attempts: {0}")]
    PortalUnavailable(String),

    #[error("portal rate limit persisted after backoff")]
    RateLimited,

    #[error("portal error {result_code}: {message}")]
    Api { result_code: i64, message: String },

    #[error("unexpected portal response ({context}, HTTP {status})")]
    Unexpected { context: &'static str, status: u16 },
}

/// Translate a `serviceErrors`/`resultCode` payload into its semantic
/// error. These are terminal: the request must not be retried.
fn translate_result_code(result_code: i64, message: String) -> PortalError {
    match result_code {
        -20101 | -22938 | -20283 => PortalError::BadCredentials,
        -20209 | -20751 | -22421 => PortalError::SessionLockedOut,
        _ => PortalError::Api {
            result_code,
            message,
        },
    }
}

/// Credentials and the interactive pieces needed to (re)establish a
/// session.
pub struct PortalCredentials {
    pub apple_id: String,
    pub password: Option<String>,
    pub prompt: Box<dyn TwoFactorPrompt>,
}

pub(crate) enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

pub(crate) struct PortalRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(&'static str, String)>,
    pub body: RequestBody,
    /// Mutating requests carry the csrf/csrf_ts header pair.
    pub mutating: bool,
}

impl PortalRequest {
    pub(crate) fn get(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, url)
    }

    pub(crate) fn post(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::POST, url)
    }

    pub(crate) fn patch(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::PATCH, url)
    }

    fn new(method: reqwest::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            mutating: false,
        }
    }

    pub(crate) fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub(crate) fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((key, value.into()));
        self
    }

    pub(crate) fn json(mut self, value: Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub(crate) fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub(crate) fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }
}

pub(crate) struct PortalResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl PortalResponse {
    pub(crate) fn json(&self) -> Result<Value, PortalError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub(crate) fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// A typed RPC surface over the Developer Portal, backed by a persistent
/// authenticated session.
pub struct DeveloperPortalClient {
    pub(crate) http: reqwest::blocking::Client,
    pub(crate) session: SessionStore,
    pub(crate) credentials: PortalCredentials,
    pub(crate) csrf: Mutex<Option<(String, String)>>,
    pub(crate) authenticated: AtomicBool,
    relogin_attempted: AtomicBool,
    transient_retries: AtomicU32,
    capabilities_cache: Mutex<Option<Vec<AvailableCapability>>>,
}

impl DeveloperPortalClient {
    /// Create a client rooted at `base_dir` (the tool home directory).
    ///
    /// Loads any persisted session for the Apple ID but performs no
    /// network traffic; authentication happens lazily on the first call
    /// that needs it.
    pub fn new(base_dir: &Path, credentials: PortalCredentials) -> Result<Self, PortalError> {
        let session = SessionStore::open(base_dir, &credentials.apple_id)?;

        let http = reqwest::blocking::ClientBuilder::default()
            .user_agent("warpsign (developer-portal crate)")
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            session,
            credentials,
            csrf: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            relogin_attempted: AtomicBool::new(false),
            transient_retries: AtomicU32::new(0),
            capabilities_cache: Mutex::new(None),
        })
    }

    /// Transient retries performed so far. The orchestrator surfaces a
    /// `retried` progress event when this is non-zero.
    pub fn transient_retries(&self) -> u32 {
        self.transient_retries.load(Ordering::Relaxed)
    }

    pub(crate) fn cached_capabilities(&self) -> Option<Vec<AvailableCapability>> {
        self.capabilities_cache.lock().expect("caps mutex").clone()
    }

    pub(crate) fn cache_capabilities(&self, caps: Vec<AvailableCapability>) {
        *self.capabilities_cache.lock().expect("caps mutex") = Some(caps);
    }

    /// Issue a request with the full policy stack: cookies, CSRF, retry
    /// with backoff, rate-limit handling, and a single silent re-login on
    /// 401/403.
    pub(crate) fn send(&self, request: &PortalRequest) -> Result<PortalResponse, PortalError> {
        let mut rate_limited_once = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let response = match self.execute_once(request) {
                Ok(response) => response,
                Err(err) if is_transient(&err) && attempt < RETRY_MAX_ATTEMPTS => {
                    self.note_retry(attempt, &format!("{err}"));
                    continue;
                }
                Err(err) if is_transient(&err) => {
                    return Err(PortalError::PortalUnavailable(err.to_string()));
                }
                Err(err) => return Err(err),
            };

            match response.status {
                status if status >= 500 => {
                    if attempt < RETRY_MAX_ATTEMPTS {
                        self.note_retry(attempt, &format!("HTTP {status}"));
                        continue;
                    }
                    return Err(PortalError::PortalUnavailable(format!("HTTP {status}")));
                }
                429 => {
                    if rate_limited_once {
                        return Err(PortalError::RateLimited);
                    }
                    rate_limited_once = true;
                    warn!("portal rate limit; backing off {RATE_LIMIT_BACKOFF:?}");
                    std::thread::sleep(RATE_LIMIT_BACKOFF);
                    continue;
                }
                // Only portal resources get the silent re-login; the
                // identity service answers 4xx as part of its own flow
                // (wrong password, pending 2FA) and must surface as-is.
                401 | 403 if !request.url.contains("idmsa.apple.com") => {
                    if self.relogin_attempted.swap(true, Ordering::SeqCst) {
                        return Err(PortalError::Unauthorized);
                    }
                    warn!("portal answered HTTP {}; re-authenticating", response.status);
                    self.session.clear()?;
                    self.authenticated.store(false, Ordering::SeqCst);
                    *self.csrf.lock().expect("csrf mutex") = None;
                    self.login()?;
                    continue;
                }
                _ => return Ok(response),
            }
        }
    }

    /// Single HTTP round trip: build, send, absorb cookies.
    fn execute_once(&self, request: &PortalRequest) -> Result<PortalResponse, PortalError> {
        let host = host_of(&request.url);

        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .query(&request.query);

        for (key, value) in &request.headers {
            builder = builder.header(*key, value);
        }

        if let Some(cookies) = self.session.cookie_header(&host) {
            builder = builder.header("Cookie", cookies);
        }

        if request.mutating {
            if let Some((csrf, csrf_ts)) = self.csrf.lock().expect("csrf mutex").clone() {
                builder = builder.header("csrf", csrf).header("csrf_ts", csrf_ts);
            }
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        };

        debug!("{} {}", request.method, request.url);
        let response = builder.send()?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        self.session.absorb_cookies(
            &host,
            headers
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        )?;

        let body = response.bytes()?.to_vec();

        Ok(PortalResponse {
            status,
            headers,
            body,
        })
    }

    fn note_retry(&self, attempt: u32, reason: &str) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
        let delay = backoff_delay(attempt, &mut rand::thread_rng());
        warn!("portal request failed ({reason}); retry {attempt} in {delay:?}");
        std::thread::sleep(delay);
    }

    /// Standard listing request against the portal's `v1` resources:
    /// POST with `X-HTTP-Method-Override: GET` and the query string
    /// tunnelled through the JSON body.
    pub(crate) fn v1_list_request(
        &self,
        url: &str,
        url_encoded_query_params: &str,
        team_id: &str,
    ) -> PortalRequest {
        PortalRequest::post(url)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-HTTP-Method-Override", "GET")
            .json(serde_json::json!({
                "urlEncodedQueryParams": url_encoded_query_params,
                "teamId": team_id,
            }))
    }

    /// Interpret a JSON body that follows the portal's `resultCode` /
    /// `serviceErrors` convention. Returns the body when it carries no
    /// error signal.
    pub(crate) fn expect_service_ok(
        &self,
        response: &PortalResponse,
        context: &'static str,
    ) -> Result<Value, PortalError> {
        let body = response.json()?;

        if let Some(errors) = body.get("serviceErrors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let code = first
                    .get("code")
                    .or_else(|| first.get("resultCode"))
                    .and_then(raw_code)
                    .unwrap_or_default();
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown service error")
                    .to_string();
                return Err(translate_result_code(code, message));
            }
        }

        if let Some(code) = body.get("resultCode").and_then(Value::as_i64) {
            if code != 0 {
                let message = body
                    .get("userString")
                    .or_else(|| body.get("resultString"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown portal error")
                    .to_string();
                return Err(translate_result_code(code, message));
            }
        }

        if response.status >= 400 {
            return Err(PortalError::Unexpected {
                context,
                status: response.status,
            });
        }

        Ok(body)
    }
}

/// `serviceErrors[].code` arrives either as a number or a numeric string.
fn raw_code(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn is_transient(err: &PortalError) -> bool {
    match err {
        PortalError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        _ => false,
    }
}

/// Exponential backoff with ±25% jitter.
fn backoff_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let base = RETRY_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rng.gen_range(-0.25f64..=0.25f64);
    let millis = (base as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(millis)
}

fn host_of(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for attempt in 1..=5u32 {
            let base = RETRY_BASE_MS * (1 << (attempt - 1));
            let delay = backoff_delay(attempt, &mut rng).as_millis() as u64;
            assert!(delay >= base * 3 / 4, "attempt {attempt}: {delay} < {}", base * 3 / 4);
            assert!(delay <= base * 5 / 4, "attempt {attempt}: {delay} > {}", base * 5 / 4);
        }
    }

    #[test]
    fn result_codes_translate_to_semantic_errors() {
        assert!(matches!(
            translate_result_code(-20101, String::new()),
            PortalError::BadCredentials
        ));
        assert!(matches!(
            translate_result_code(-22938, String::new()),
            PortalError::BadCredentials
        ));
        assert!(matches!(
            translate_result_code(-20209, String::new()),
            PortalError::SessionLockedOut
        ));
        assert!(matches!(
            translate_result_code(12345, "x".into()),
            PortalError::Api {
                result_code: 12345,
                ..
            }
        ));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://developer.apple.com/services-account/v1/bundleIds"),
            "developer.apple.com"
        );
        assert_eq!(host_of("https://idmsa.apple.com/appleauth/auth"), "idmsa.apple.com");
    }

    #[test]
    fn string_service_error_codes_parse() {
        assert_eq!(raw_code(&serde_json::json!("-20101")), Some(-20101));
        assert_eq!(raw_code(&serde_json::json!(-20101)), Some(-20101));
        assert_eq!(raw_code(&serde_json::json!("nope")), None);
    }
}
