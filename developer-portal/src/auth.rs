// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Login state machine for the Apple identity service.
//!
//! `Anonymous -> SrpChallenging -> AwaitingSecondFactor -> TrustedSession`,
//! with any state collapsing to `Expired` when the portal stops honouring
//! the session. A persisted session short-circuits the whole dance: the
//! client probes the portal and, if the cookies still work, no SRP
//! exchange happens at all.

use {
    crate::{
        srp::{SrpClient, SrpProtocol},
        DeveloperPortalClient, PortalError, PortalRequest,
    },
    base64::{engine::general_purpose::STANDARD as BASE64, Engine},
    log::{debug, info, warn},
    serde_json::{json, Value},
    std::sync::atomic::Ordering,
};

const AUTH_ENDPOINT: &str = "https://idmsa.apple.com/appleauth/auth";
const WIDGET_KEY_URL: &str =
    "https://appstoreconnect.apple.com/olympus/v1/app/config?hostname=itunesconnect.apple.com";
const SESSION_PROBE_URL: &str = "https://developer.apple.com/services-account/v1/certificates";
const CSRF_PAGE_URL: &str = "https://developer.apple.com/account/resources";

/// Which second factor the portal asked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TwoFactorMode {
    TrustedDevice,
    Sms,
    SecurityKey,
}

/// Caller-supplied acquisition of a second-factor code.
///
/// `hint` carries whatever the portal told us about the challenge target
/// (e.g. a masked phone number).
pub trait TwoFactorPrompt: Send + Sync {
    fn prompt(&self, mode: TwoFactorMode, hint: Option<&str>) -> Result<String, PortalError>;
}

/// Observable login progress, mostly for logging and tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AuthPhase {
    Anonymous,
    SrpChallenging,
    AwaitingSecondFactor,
    TrustedSession,
}

impl DeveloperPortalClient {
    /// Make sure the client holds a working session, logging in from
    /// scratch only when the persisted one is missing or stale.
    pub fn ensure_authenticated(&self) -> Result<(), PortalError> {
        if self.authenticated.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.session.has_trusted_session() && self.probe_session()? {
            info!("reusing persisted portal session");
            self.fetch_csrf_tokens()?;
            self.authenticated.store(true, Ordering::SeqCst);
            return Ok(());
        }

        if self.session.has_trusted_session() {
            warn!("persisted session is stale; discarding");
            self.session.clear()?;
        }

        self.login()
    }

    /// Full SRP + two-factor login.
    pub(crate) fn login(&self) -> Result<(), PortalError> {
        let mut phase = AuthPhase::Anonymous;
        debug!("auth phase: {phase:?}");

        let password = self
            .credentials
            .password
            .as_deref()
            .ok_or(PortalError::BadCredentials)?;

        let widget_key = self.widget_key()?;
        let srp = SrpClient::new();

        phase = AuthPhase::SrpChallenging;
        debug!("auth phase: {phase:?}");

        let init_body = json!({
            "a": BASE64.encode(srp.public_key()),
            "accountName": self.credentials.apple_id,
            "protocols": ["s2k", "s2k_fo"],
        });

        let init = self.send(
            &self
                .auth_request(PortalRequest::post(format!("{AUTH_ENDPOINT}/signin/init")), &widget_key)
                .json(init_body),
        )?;
        let init_json = self.expect_service_ok(&init, "signin/init")?;

        let salt = base64_field(&init_json, "salt")?;
        let server_public = base64_field(&init_json, "b")?;
        let challenge_id = str_field(&init_json, "c")?;
        let iterations = init_json
            .get("iteration")
            .and_then(Value::as_u64)
            .ok_or(PortalError::Unexpected {
                context: "signin/init iteration",
                status: init.status,
            })? as u32;

        let protocol = init_json
            .get("protocol")
            .and_then(Value::as_str)
            .and_then(SrpProtocol::parse)
            .unwrap_or(SrpProtocol::S2k);

        let evidence = srp.process_challenge(
            &self.credentials.apple_id,
            password,
            protocol,
            &salt,
            iterations,
            &server_public,
        )?;

        let complete_body = json!({
            "accountName": self.credentials.apple_id,
            "c": challenge_id,
            "m1": BASE64.encode(&evidence.m1),
            "m2": BASE64.encode(&evidence.m2),
            "rememberMe": false,
        });

        let complete = self.send(
            &self
                .auth_request(
                    PortalRequest::post(format!("{AUTH_ENDPOINT}/signin/complete")),
                    &widget_key,
                )
                .query("isRememberMeEnabled", "false")
                .json(complete_body),
        )?;

        match complete.status {
            409 => {
                phase = AuthPhase::AwaitingSecondFactor;
                debug!("auth phase: {phase:?}");
                self.second_factor(&complete, &widget_key)?;
            }
            200 | 204 | 302 => {
                // Trusted without a challenge; still capture session ids
                // when the server handed them out.
                if let (Some(session_id), Some(scnt)) = (
                    complete.header("X-Apple-ID-Session-Id"),
                    complete.header("scnt"),
                ) {
                    self.session.store_trusted(session_id, scnt)?;
                }
            }
            _ => {
                // Body may carry a serviceErrors explanation (wrong
                // password is the common one).
                self.expect_service_ok(&complete, "signin/complete")?;
                return Err(PortalError::Unexpected {
                    context: "signin/complete",
                    status: complete.status,
                });
            }
        }

        phase = AuthPhase::TrustedSession;
        debug!("auth phase: {phase:?}");

        self.fetch_csrf_tokens()?;
        self.authenticated.store(true, Ordering::SeqCst);
        info!("portal login complete for {}", self.credentials.apple_id);
        Ok(())
    }

    /// Handle the HSA2 challenge carried by a 409 `signin/complete`.
    fn second_factor(
        &self,
        complete: &crate::PortalResponse,
        widget_key: &str,
    ) -> Result<(), PortalError> {
        let session_id = complete
            .header("X-Apple-ID-Session-Id")
            .ok_or(PortalError::TwoFactorFailed("no session id in challenge".into()))?;
        let scnt = complete
            .header("scnt")
            .ok_or(PortalError::TwoFactorFailed("no scnt in challenge".into()))?;

        let (mode, hint, verify_url, extra) = self.challenge_mode(complete);

        if mode == TwoFactorMode::SecurityKey {
            return Err(PortalError::TwoFactorFailed(
                "security keys are not supported; remove the key requirement or use SMS".into(),
            ));
        }

        let code = self
            .credentials
            .prompt
            .prompt(mode, hint.as_deref())?
            .trim()
            .to_string();

        let mut body = json!({ "securityCode": { "code": code } });
        if let Some(extra) = extra {
            merge(&mut body, extra);
        }

        let verify = self.send(
            &self
                .auth_request(PortalRequest::post(verify_url), widget_key)
                .header("X-Apple-ID-Session-Id", session_id.clone())
                .header("scnt", scnt.clone())
                .json(body),
        )?;

        if !(200..=204).contains(&verify.status) {
            return Err(PortalError::TwoFactorFailed(format!(
                "code rejected (HTTP {})",
                verify.status
            )));
        }

        let trust = self.send(
            &self
                .auth_request(PortalRequest::get(format!("{AUTH_ENDPOINT}/2sv/trust")), widget_key)
                .header("X-Apple-ID-Session-Id", session_id.clone())
                .header("scnt", scnt.clone()),
        )?;

        if !(200..=204).contains(&trust.status) {
            return Err(PortalError::TwoFactorFailed(format!(
                "session trust rejected (HTTP {})",
                trust.status
            )));
        }

        self.session.store_trusted(session_id, scnt)?;
        Ok(())
    }

    /// Decide which second factor the challenge response is asking for.
    fn challenge_mode(
        &self,
        complete: &crate::PortalResponse,
    ) -> (TwoFactorMode, Option<String>, String, Option<Value>) {
        let body: Value = serde_json::from_slice(&complete.body).unwrap_or(Value::Null);

        let has_trusted_devices = body
            .get("trustedDevices")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false)
            || body.get("securityCode").is_some();

        if has_trusted_devices {
            return (
                TwoFactorMode::TrustedDevice,
                None,
                format!("{AUTH_ENDPOINT}/verify/trusteddevice/securitycode"),
                None,
            );
        }

        if let Some(phones) = body.get("trustedPhoneNumbers").and_then(Value::as_array) {
            if let Some(phone) = phones.first() {
                let id = phone.get("id").and_then(Value::as_i64).unwrap_or(1);
                let hint = phone
                    .get("numberWithDialCode")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                return (
                    TwoFactorMode::Sms,
                    hint,
                    format!("{AUTH_ENDPOINT}/verify/phone/securitycode"),
                    Some(json!({ "phoneNumber": { "id": id }, "mode": "sms" })),
                );
            }
        }

        if body.get("fsaChallenge").is_some() {
            return (
                TwoFactorMode::SecurityKey,
                None,
                String::new(),
                None,
            );
        }

        // No challenge detail; trusted-device is the portal default.
        (
            TwoFactorMode::TrustedDevice,
            None,
            format!("{AUTH_ENDPOINT}/verify/trusteddevice/securitycode"),
            None,
        )
    }

    /// The widget key (`X-Apple-Widget-Key`) from the auth bootstrap
    /// endpoint, cached in the session file.
    pub(crate) fn widget_key(&self) -> Result<String, PortalError> {
        if let Some(key) = self.session.snapshot().widget_key {
            return Ok(key);
        }

        let response = self.send(&PortalRequest::get(WIDGET_KEY_URL))?;
        let body = response.json()?;
        let key = body
            .get("authServiceKey")
            .and_then(Value::as_str)
            .ok_or(PortalError::Unexpected {
                context: "widget key bootstrap",
                status: response.status,
            })?
            .to_string();

        self.session.store_widget_key(key.clone())?;
        Ok(key)
    }

    /// Whether the persisted session still authenticates.
    ///
    /// The certificates endpoint answers 403 for an authenticated session
    /// with no team scoping, which is exactly the signal we need; any
    /// other status means the cookies are stale.
    fn probe_session(&self) -> Result<bool, PortalError> {
        let snapshot = self.session.snapshot();
        let (Some(session_id), Some(scnt)) = (snapshot.session_id, snapshot.scnt) else {
            return Ok(false);
        };

        let response = self.execute_probe(&session_id, &scnt)?;
        Ok(response == 403)
    }

    fn execute_probe(&self, session_id: &str, scnt: &str) -> Result<u16, PortalError> {
        let request = PortalRequest::get(SESSION_PROBE_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-Apple-ID-Session-Id", session_id.to_string())
            .header("scnt", scnt.to_string());

        // Deliberately bypass self.send: a 403 here is the success signal,
        // not a trigger for re-login.
        let response = self.execute_probe_raw(&request)?;
        Ok(response)
    }

    fn execute_probe_raw(&self, request: &PortalRequest) -> Result<u16, PortalError> {
        let host = "developer.apple.com";

        let mut builder = self.http.get(&request.url);
        for (key, value) in &request.headers {
            builder = builder.header(*key, value);
        }
        if let Some(cookies) = self.session.cookie_header(host) {
            builder = builder.header("Cookie", cookies);
        }

        match builder.send() {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) => Err(err.into()),
        }
    }

    /// Harvest the csrf/csrf_ts pair needed by mutating portal calls.
    fn fetch_csrf_tokens(&self) -> Result<(), PortalError> {
        let response = self.send(&PortalRequest::get(CSRF_PAGE_URL))?;

        let mut csrf = self
            .session
            .cookie_value("csrf")
            .or_else(|| response.header("csrf"));
        let mut csrf_ts = self
            .session
            .cookie_value("csrf_ts")
            .or_else(|| response.header("csrf_ts"));

        if csrf.is_none() || csrf_ts.is_none() {
            let page = String::from_utf8_lossy(&response.body);
            if csrf.is_none() {
                csrf = extract_page_token(&page, "csrf");
            }
            if csrf_ts.is_none() {
                csrf_ts = extract_page_token(&page, "csrf_ts");
            }
        }

        match (csrf, csrf_ts) {
            (Some(csrf), Some(csrf_ts)) => {
                debug!("csrf tokens acquired");
                *self.csrf.lock().expect("csrf mutex") = Some((csrf, csrf_ts));
                Ok(())
            }
            _ => {
                // Listing endpoints work without them; only mutations will
                // fail, and loudly.
                warn!("could not locate csrf tokens; portal mutations may be rejected");
                Ok(())
            }
        }
    }

    fn auth_request(&self, request: PortalRequest, widget_key: &str) -> PortalRequest {
        let mut request = request
            .header("Accept", "application/json, text/javascript")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-Apple-Widget-Key", widget_key.to_string());

        let snapshot = self.session.snapshot();
        if let (Some(session_id), Some(scnt)) = (snapshot.session_id, snapshot.scnt) {
            request = request
                .header("X-Apple-ID-Session-Id", session_id)
                .header("scnt", scnt);
        }

        request
    }
}

fn base64_field(body: &Value, key: &'static str) -> Result<Vec<u8>, PortalError> {
    let raw = body
        .get(key)
        .and_then(Value::as_str)
        .ok_or(PortalError::Unexpected {
            context: "missing SRP challenge field",
            status: 200,
        })?;
    BASE64
        .decode(raw)
        .map_err(|_| PortalError::Unexpected {
            context: "undecodable SRP challenge field",
            status: 200,
        })
}

fn str_field(body: &Value, key: &'static str) -> Result<String, PortalError> {
    body.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or(PortalError::Unexpected {
            context: "missing SRP challenge field",
            status: 200,
        })
}

/// Pull `name: "value"` out of an HTML page, the way the portal inlines
/// its csrf tokens.
fn extract_page_token(page: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"{name}["']\s*:\s*["']([^"']+)["']"#);
    regex::Regex::new(&pattern)
        .ok()?
        .captures(page)
        .map(|c| c[1].to_string())
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (k, v) in extra {
            target.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_token_extraction_handles_both_quote_styles() {
        let page = r#"var config = {csrf: 'abc-123', csrf_ts: "1700000000"};"#;
        assert_eq!(extract_page_token(page, "csrf").as_deref(), Some("abc-123"));
        assert_eq!(
            extract_page_token(page, "csrf_ts").as_deref(),
            Some("1700000000")
        );
        assert_eq!(extract_page_token(page, "missing"), None);
    }

    #[test]
    fn merge_extends_objects() {
        let mut base = json!({"securityCode": {"code": "123456"}});
        merge(&mut base, json!({"mode": "sms"}));
        assert_eq!(base["mode"], "sms");
        assert_eq!(base["securityCode"]["code"], "123456");
    }
}
