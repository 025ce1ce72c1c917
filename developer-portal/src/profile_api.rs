// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profile materialisation.
//!
//! Creation goes through the portal's regen action (which both creates
//! and refreshes), then the DER-encoded mobileprovision payload is pulled
//! from the download endpoint.

use {
    crate::{DeveloperPortalClient, PortalError, PortalRequest},
    log::{debug, info},
    serde_json::Value,
};

const PROFILES_URL: &str = "https://developer.apple.com/services-account/v1/profiles";
const REGEN_PROFILE_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/ios/profile/regenProvisioningProfile.action";
const DOWNLOAD_PROFILE_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/ios/profile/downloadProfileContent";
const DELETE_PROFILE_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/ios/profile/deleteProvisioningProfile.action";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProfileKind {
    Development,
    AdHoc,
}

impl ProfileKind {
    /// The portal's internal `distributionType` value.
    pub fn distribution_type(self) -> &'static str {
        match self {
            Self::Development => "limited",
            Self::AdHoc => "adhoc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Development => "Development",
            Self::AdHoc => "Ad Hoc",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    pub resource_id: String,
    pub name: String,
    pub platform: String,
    pub profile_state: String,
    pub type_label: String,
}

impl DeveloperPortalClient {
    pub fn list_profiles(&self, team_id: &str) -> Result<Vec<ProvisioningProfile>, PortalError> {
        self.ensure_authenticated()?;

        let request = self.v1_list_request(
            PROFILES_URL,
            "limit=1000&fields[profiles]=name,platform,platformName,profileTypeLabel,expirationDate,profileState&sort=name",
            team_id,
        );
        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "profiles")?;

        let profiles = body
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|p| {
                let attrs = p.get("attributes")?;
                Some(ProvisioningProfile {
                    resource_id: p.get("id")?.as_str()?.to_string(),
                    name: attrs.get("name")?.as_str()?.to_string(),
                    platform: attrs
                        .get("platform")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    profile_state: attrs
                        .get("profileState")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    type_label: attrs
                        .get("profileTypeLabel")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect::<Vec<_>>();

        debug!("team {team_id} has {} profile(s)", profiles.len());
        Ok(profiles)
    }

    /// Create (or regenerate) a profile binding `app_id_resource` to the
    /// certificate and device set, and return the mobileprovision bytes.
    pub fn create_profile(
        &self,
        team_id: &str,
        app_id_resource: &str,
        profile_name: &str,
        certificate_ids: &[String],
        device_ids: &[String],
        kind: ProfileKind,
    ) -> Result<Vec<u8>, PortalError> {
        self.ensure_authenticated()?;

        info!(
            "creating {} profile {profile_name} ({} devices)",
            kind.label(),
            device_ids.len()
        );

        let request = PortalRequest::post(REGEN_PROFILE_URL)
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(vec![
                ("appIdId".into(), app_id_resource.into()),
                ("provisioningProfileId".into(), String::new()),
                ("distributionType".into(), kind.distribution_type().into()),
                ("provisioningProfileName".into(), profile_name.into()),
                ("certificateIds".into(), certificate_ids.join(",")),
                ("deviceIds".into(), device_ids.join(",")),
                ("teamId".into(), team_id.into()),
                ("subPlatform".into(), String::new()),
                ("isExcludeAudiences".into(), String::new()),
                ("returnFullObjects".into(), "false".into()),
            ])
            .mutating();

        let response = self.send(&request)?;
        let body = match self.expect_service_ok(&response, "regenProvisioningProfile") {
            Ok(body) => body,
            Err(PortalError::Api { result_code, message }) => {
                return Err(PortalError::ProfileCreationFailed(format!(
                    "{profile_name}: {message} (code {result_code})"
                )))
            }
            Err(err) => return Err(err),
        };

        let profile_id = body
            .get("provisioningProfile")
            .and_then(|p| p.get("provisioningProfileId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PortalError::ProfileCreationFailed(format!("{profile_name}: no profile id returned"))
            })?
            .to_string();

        self.download_profile(team_id, &profile_id)
    }

    /// Raw mobileprovision payload for an existing profile.
    pub fn download_profile(
        &self,
        team_id: &str,
        profile_id: &str,
    ) -> Result<Vec<u8>, PortalError> {
        self.ensure_authenticated()?;
        debug!("downloading provisioning profile {profile_id}");

        let request = PortalRequest::get(DOWNLOAD_PROFILE_URL)
            .header("Accept", "*/*")
            .header("X-Requested-With", "XMLHttpRequest")
            .query("teamId", team_id)
            .query("provisioningProfileId", profile_id);

        let response = self.send(&request)?;
        if response.status != 200 {
            return Err(PortalError::ProfileCreationFailed(format!(
                "download of {profile_id} answered HTTP {}",
                response.status
            )));
        }

        Ok(response.body)
    }

    pub fn delete_profile(&self, team_id: &str, profile_id: &str) -> Result<(), PortalError> {
        self.ensure_authenticated()?;
        info!("deleting provisioning profile {profile_id}");

        let request = PortalRequest::post(DELETE_PROFILE_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(vec![
                ("provisioningProfileId".into(), profile_id.into()),
                ("teamId".into(), team_id.into()),
            ])
            .mutating();

        let response = self.send(&request)?;
        self.expect_service_ok(&response, "deleteProvisioningProfile")?;
        Ok(())
    }
}
