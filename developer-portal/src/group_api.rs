// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App groups and iCloud containers.
//!
//! These ride the portal's older `QH65B2` action endpoints, which are
//! form-encoded and signal "already exists" through a free-text
//! `userString` rather than a status code.

use {
    crate::{DeveloperPortalClient, PortalError, PortalRequest},
    log::{debug, info},
    serde_json::Value,
};

const LIST_APP_GROUPS_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/ios/identifiers/listApplicationGroups.action";
const ADD_APP_GROUP_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/ios/identifiers/addApplicationGroup.action";
const LIST_CONTAINERS_URL: &str = "https://developer.apple.com/services-account/v1/cloudContainers";
const ADD_CONTAINER_URL: &str = "https://developer.apple.com/services-account/QH65B2/account/cloudContainer/addCloudContainer.action";

/// Marker the action endpoints embed when an identifier is taken.
const TAKEN_MARKER: &str = "is not available. Please enter a different string.";

#[derive(Clone, Debug)]
pub struct AppGroup {
    pub resource_id: String,
    pub identifier: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct CloudContainer {
    pub resource_id: String,
    pub identifier: String,
    pub name: String,
}

impl DeveloperPortalClient {
    pub fn list_app_groups(&self, team_id: &str) -> Result<Vec<AppGroup>, PortalError> {
        self.ensure_authenticated()?;

        let request = PortalRequest::post(LIST_APP_GROUPS_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(vec![
                ("onlyCountLists".into(), "true".into()),
                ("pageSize".into(), "1000".into()),
                ("pageNumber".into(), "1".into()),
                ("sort".into(), "name=asc".into()),
                ("teamId".into(), team_id.into()),
            ]);

        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "listApplicationGroups")?;

        let groups = body
            .get("applicationGroupList")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|g| {
                Some(AppGroup {
                    resource_id: g.get("applicationGroup")?.as_str()?.to_string(),
                    identifier: g.get("identifier")?.as_str()?.to_string(),
                    name: g
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect::<Vec<_>>();

        debug!("team {team_id} has {} app group(s)", groups.len());
        Ok(groups)
    }

    /// Register an app group, returning the existing one when taken.
    pub fn register_app_group(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> Result<AppGroup, PortalError> {
        self.ensure_authenticated()?;
        info!("registering app group {identifier}");

        let request = PortalRequest::post(ADD_APP_GROUP_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(vec![
                ("name".into(), name.into()),
                ("identifier".into(), identifier.into()),
                ("teamId".into(), team_id.into()),
            ])
            .mutating();

        let response = self.send(&request)?;
        let body = response.json()?;

        if user_string_says_taken(&body) {
            debug!("app group {identifier} exists; fetching");
            return self
                .list_app_groups(team_id)?
                .into_iter()
                .find(|g| g.identifier == identifier)
                .ok_or_else(|| PortalError::IdentifierConflict(identifier.to_string()));
        }

        let body = self.expect_service_ok(&response, "addApplicationGroup")?;
        let group = body.get("applicationGroup").ok_or(PortalError::Unexpected {
            context: "addApplicationGroup payload",
            status: response.status,
        })?;

        Ok(AppGroup {
            resource_id: group
                .get("applicationGroup")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            identifier: group
                .get("identifier")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: group
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn list_cloud_containers(&self, team_id: &str) -> Result<Vec<CloudContainer>, PortalError> {
        self.ensure_authenticated()?;

        let request = self.v1_list_request(LIST_CONTAINERS_URL, "limit=1000", team_id);
        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "cloudContainers")?;

        let containers = body
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| {
                let attrs = c.get("attributes")?;
                Some(CloudContainer {
                    resource_id: c.get("id")?.as_str()?.to_string(),
                    identifier: attrs.get("identifier")?.as_str()?.to_string(),
                    name: attrs
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect::<Vec<_>>();

        debug!("team {team_id} has {} iCloud container(s)", containers.len());
        Ok(containers)
    }

    pub fn register_cloud_container(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> Result<CloudContainer, PortalError> {
        self.ensure_authenticated()?;
        info!("registering iCloud container {identifier}");

        let request = PortalRequest::post(ADD_CONTAINER_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(vec![
                ("name".into(), name.into()),
                ("identifier".into(), identifier.into()),
                ("teamId".into(), team_id.into()),
            ])
            .mutating();

        let response = self.send(&request)?;
        let body = response.json()?;

        if user_string_says_taken(&body) {
            debug!("iCloud container {identifier} exists; fetching");
            return self
                .list_cloud_containers(team_id)?
                .into_iter()
                .find(|c| c.identifier == identifier)
                .ok_or_else(|| PortalError::IdentifierConflict(identifier.to_string()));
        }

        let body = self.expect_service_ok(&response, "addCloudContainer")?;
        let container = body.get("cloudContainer").ok_or(PortalError::Unexpected {
            context: "addCloudContainer payload",
            status: response.status,
        })?;

        Ok(CloudContainer {
            resource_id: container
                .get("cloudContainer")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            identifier: container
                .get("identifier")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: container
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn user_string_says_taken(body: &Value) -> bool {
    body.get("userString")
        .and_then(Value::as_str)
        .map(|s| s.contains(TAKEN_MARKER))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn taken_marker_detection() {
        let taken = json!({
            "resultCode": 1,
            "userString": "'group.x' is not available. Please enter a different string."
        });
        let fresh = json!({ "resultCode": 0, "applicationGroup": {} });

        assert!(user_string_says_taken(&taken));
        assert!(!user_string_says_taken(&fresh));
    }
}
