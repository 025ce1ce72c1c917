// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{DeveloperPortalClient, PortalError, PortalRequest},
    log::info,
    serde_json::{json, Value},
};

const CERTIFICATES_URL: &str = "https://developer.apple.com/services-account/v1/certificates";

/// Whether a certificate can sign development or distribution builds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertificateKind {
    Development,
    Distribution,
}

impl CertificateKind {
    /// Classify the portal's `certificateType` strings
    /// (`DEVELOPMENT`, `IOS_DEVELOPMENT`, `DISTRIBUTION`, ...).
    pub fn from_portal_type(portal_type: &str) -> Option<Self> {
        let t = portal_type.to_ascii_uppercase();
        if t.contains("DEVELOPMENT") {
            Some(Self::Development)
        } else if t.contains("DISTRIBUTION") {
            Some(Self::Distribution)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Certificate {
    /// Portal resource id, used when creating profiles.
    pub resource_id: String,
    pub serial_number: String,
    pub name: String,
    pub kind: CertificateKind,
    pub expiration_date: Option<String>,
}

impl DeveloperPortalClient {
    pub fn list_certificates(&self, team_id: &str) -> Result<Vec<Certificate>, PortalError> {
        self.ensure_authenticated()?;

        let request = PortalRequest::post(CERTIFICATES_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-HTTP-Method-Override", "GET")
            .json(json!({
                "urlEncodedQueryParams": "limit=1000&sort=displayName",
                "teamId": team_id,
            }));

        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "certificates")?;

        let mut certificates = Vec::new();
        for cert in body.get("data").and_then(Value::as_array).into_iter().flatten() {
            let Some(attrs) = cert.get("attributes") else {
                continue;
            };
            let portal_type = attrs
                .get("certificateType")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(kind) = CertificateKind::from_portal_type(portal_type) else {
                // Services certs, APNs certs and the like; not usable here.
                continue;
            };

            certificates.push(Certificate {
                resource_id: cert
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                serial_number: attrs
                    .get("serialNumber")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: attrs
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind,
                expiration_date: attrs
                    .get("expirationDate")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
            });
        }

        info!("team {team_id} has {} signing certificate(s)", certificates.len());
        Ok(certificates)
    }
}
