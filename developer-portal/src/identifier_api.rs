// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundle identifier registration and capability management.
//!
//! The capability update endpoint is all-or-nothing: a PATCH must carry
//! the complete `bundleIdCapabilities` relationship array, enabled flags
//! for every capability the team can see, plus per-capability settings
//! defaults and resource relationships for app groups and iCloud
//! containers. The shape mirrors what the portal web UI sends.

use {
    crate::{DeveloperPortalClient, PortalError, PortalRequest},
    log::{debug, info, warn},
    serde_json::{json, Value},
};

const BUNDLE_IDS_URL: &str = "https://developer.apple.com/services-account/v1/bundleIds";
const CAPABILITIES_URL: &str = "https://developer.apple.com/services-account/v1/capabilities";

/// `resultCode` the portal uses for "identifier already registered".
const RESULT_CODE_EXISTS: i64 = 9400;

#[derive(Clone, Debug)]
pub struct BundleIdentifier {
    pub resource_id: String,
    pub identifier: String,
    pub name: String,
}

/// One capability as advertised by the portal for this account, with the
/// entitlement keys (`profileKey`s) it governs.
#[derive(Clone, Debug)]
pub struct AvailableCapability {
    pub id: String,
    pub name: String,
    /// `false` means the portal force-enables it on every identifier.
    pub optional: bool,
    pub editable: bool,
    pub profile_keys: Vec<String>,
    pub distribution_types: Vec<String>,
    pub supports_ios: bool,
}

/// Resource ids to attach when enabling relationship-bearing capabilities.
#[derive(Clone, Debug, Default)]
pub struct CapabilityRelationships {
    pub app_group_ids: Vec<String>,
    pub cloud_container_ids: Vec<String>,
}

impl DeveloperPortalClient {
    pub fn list_identifiers(&self, team_id: &str) -> Result<Vec<BundleIdentifier>, PortalError> {
        self.ensure_authenticated()?;

        let request = self.v1_list_request(
            BUNDLE_IDS_URL,
            "limit=1000&sort=name&filter[platform]=IOS,MACOS",
            team_id,
        );
        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "bundleIds")?;

        Ok(parse_bundle_ids(&body))
    }

    /// Exact-match lookup of a registered identifier.
    pub fn find_identifier(
        &self,
        team_id: &str,
        identifier: &str,
    ) -> Result<Option<BundleIdentifier>, PortalError> {
        self.ensure_authenticated()?;

        let request = self.v1_list_request(
            BUNDLE_IDS_URL,
            &format!("filter[identifier]={identifier}"),
            team_id,
        );
        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "bundleIds filter")?;

        // The filter is a substring match; insist on equality.
        Ok(parse_bundle_ids(&body)
            .into_iter()
            .find(|b| b.identifier == identifier))
    }

    /// Register a bundle identifier, returning the existing record when
    /// the portal already has it.
    pub fn register_identifier(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> Result<BundleIdentifier, PortalError> {
        self.ensure_authenticated()?;

        info!("registering bundle identifier {identifier}");

        let payload = json!({
            "data": {
                "type": "bundleIds",
                "attributes": {
                    "identifier": identifier,
                    "name": name,
                    "seedId": team_id,
                    "teamId": team_id,
                },
                "relationships": { "bundleIdCapabilities": { "data": [] } },
            }
        });

        let request = PortalRequest::post(BUNDLE_IDS_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(payload)
            .mutating();

        let response = self.send(&request)?;

        if response.status == 409 {
            let body = response.json()?;
            let code = body
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|e| e.first())
                .and_then(|e| e.get("resultCode"))
                .and_then(Value::as_i64);

            if code == Some(RESULT_CODE_EXISTS) {
                debug!("identifier {identifier} already registered; fetching");
                return self
                    .find_identifier(team_id, identifier)?
                    .ok_or_else(|| PortalError::IdentifierConflict(identifier.to_string()));
            }

            return Err(PortalError::IdentifierConflict(format!(
                "{identifier}: {}",
                String::from_utf8_lossy(&response.body)
            )));
        }

        let body = self.expect_service_ok(&response, "register bundleId")?;
        let data = body.get("data").ok_or(PortalError::Unexpected {
            context: "register bundleId payload",
            status: response.status,
        })?;

        parse_bundle_id(data).ok_or(PortalError::Unexpected {
            context: "register bundleId record",
            status: response.status,
        })
    }

    /// The capabilities this account may enable, with entitlement keys
    /// attached. Cached for the lifetime of the client: the answer is
    /// account-wide, not per identifier.
    pub fn list_available_capabilities(
        &self,
        team_id: &str,
    ) -> Result<Vec<AvailableCapability>, PortalError> {
        if let Some(cached) = self.cached_capabilities() {
            return Ok(cached);
        }

        self.ensure_authenticated()?;

        let request = PortalRequest::post(CAPABILITIES_URL)
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-HTTP-Method-Override", "GET")
            .query("filter[capabilityType]", "capability,service")
            .json(json!({
                "urlEncodedQueryParams": "filter[platform]=IOS,MACOS",
                "teamId": team_id,
            }));

        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "capabilities")?;

        let capabilities = parse_available_capabilities(&body);
        info!("portal advertises {} capabilities", capabilities.len());
        self.cache_capabilities(capabilities.clone());
        Ok(capabilities)
    }

    /// Rewrite an identifier's capability set.
    ///
    /// `enable` lists capability ids to switch on; everything the portal
    /// marks non-optional is force-enabled regardless.
    pub fn update_identifier_capabilities(
        &self,
        team_id: &str,
        resource_id: &str,
        identifier: &str,
        enable: &[String],
        relationships: &CapabilityRelationships,
    ) -> Result<(), PortalError> {
        self.ensure_authenticated()?;

        let available = self.list_available_capabilities(team_id)?;
        let mut capabilities_data = Vec::new();

        for cap in &available {
            let required = !cap.optional;
            let should_enable = required || enable.contains(&cap.id);

            if required {
                debug!("capability {} is mandatory; enabling", cap.id);
            } else if should_enable {
                info!("enabling capability {} on {identifier}", cap.id);
            }

            let mut entry = json!({
                "type": "bundleIdCapabilities",
                "attributes": {
                    "enabled": should_enable,
                    "settings": if should_enable { capability_settings(&cap.id) } else { json!([]) },
                },
                "relationships": {
                    "capability": { "data": { "type": "capabilities", "id": cap.id } }
                },
            });

            if should_enable {
                if let Some((rel_name, ids)) = relationship_payload(&cap.id, relationships) {
                    if !ids.is_empty() {
                        entry["relationships"][rel_name] = json!({
                            "data": ids
                                .iter()
                                .map(|id| json!({ "id": id, "type": rel_name }))
                                .collect::<Vec<_>>()
                        });
                    }
                }
            }

            capabilities_data.push(entry);
        }

        let payload = json!({
            "data": {
                "type": "bundleIds",
                "id": resource_id,
                "attributes": {
                    "identifier": identifier,
                    "permissions": { "edit": true, "delete": true },
                    "seedId": team_id,
                    "name": identifier,
                    "wildcard": false,
                    "teamId": team_id,
                },
                "relationships": { "bundleIdCapabilities": { "data": capabilities_data } },
            }
        });

        let request = PortalRequest::patch(format!("{BUNDLE_IDS_URL}/{resource_id}"))
            .header("Accept", "application/json, text/plain, */*")
            .header("Content-Type", "application/vnd.api+json")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(payload)
            .mutating();

        let response = self.send(&request)?;
        if response.status != 200 {
            warn!(
                "capability update for {identifier} answered HTTP {}",
                response.status
            );
            self.expect_service_ok(&response, "update capabilities")?;
            return Err(PortalError::Unexpected {
                context: "update capabilities",
                status: response.status,
            });
        }

        Ok(())
    }
}

/// Settings payloads certain capabilities refuse to enable without.
fn capability_settings(capability_id: &str) -> Value {
    match capability_id {
        "ENABLED_FOR_MAC" => json!([
            { "key": "ENABLED_FOR_MAC_APP_SETUP", "options": [{ "key": "USE_IOS_APPID" }] }
        ]),
        "PUSH_NOTIFICATIONS" => json!([
            {
                "key": "PUSH_NOTIFICATION_FEATURES",
                "options": [{ "key": "PUSH_NOTIFICATION_FEATURE_BROADCAST" }]
            }
        ]),
        "APPLE_ID_AUTH" => json!([
            { "key": "APPLE_ID_AUTH_APP_CONSENT", "options": [{ "key": "PRIMARY_APP_CONSENT" }] }
        ]),
        "DATA_PROTECTION" => json!([
            { "key": "DATA_PROTECTION_PERMISSION_LEVEL", "options": [{ "key": "COMPLETE_PROTECTION" }] }
        ]),
        "ICLOUD" => json!([
            { "key": "ICLOUD_VERSION", "options": [{ "key": "XCODE_6" }] }
        ]),
        _ => json!([]),
    }
}

/// Capabilities that carry a resource relationship when enabled.
fn relationship_payload<'a>(
    capability_id: &str,
    relationships: &'a CapabilityRelationships,
) -> Option<(&'static str, &'a [String])> {
    match capability_id {
        "APP_GROUPS" => Some(("appGroups", &relationships.app_group_ids)),
        "ICLOUD" => Some(("cloudContainers", &relationships.cloud_container_ids)),
        _ => None,
    }
}

fn parse_bundle_ids(body: &Value) -> Vec<BundleIdentifier> {
    body.get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(parse_bundle_id)
        .collect()
}

fn parse_bundle_id(record: &Value) -> Option<BundleIdentifier> {
    let attrs = record.get("attributes")?;
    Some(BundleIdentifier {
        resource_id: record.get("id")?.as_str()?.to_string(),
        identifier: attrs.get("identifier")?.as_str()?.to_string(),
        name: attrs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_available_capabilities(body: &Value) -> Vec<AvailableCapability> {
    let mut out = Vec::new();

    for item in body.get("data").and_then(Value::as_array).into_iter().flatten() {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let attrs = item.get("attributes").cloned().unwrap_or(Value::Null);

        let mut profile_keys = Vec::new();
        collect_profile_keys(&attrs, &mut profile_keys);

        let distribution_types = attrs
            .get("distributionTypes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|d| d.get("displayValue").and_then(Value::as_str))
            .map(|s| s.to_string())
            .collect();

        let supports_ios = attrs
            .get("supportedSDKs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .any(|sdk| sdk.get("displayValue").and_then(Value::as_str) == Some("iOS"));

        out.push(AvailableCapability {
            id: id.to_string(),
            name: attrs
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            optional: attrs.get("optional").and_then(Value::as_bool).unwrap_or(true),
            editable: attrs.get("editable").and_then(Value::as_bool).unwrap_or(false),
            profile_keys,
            distribution_types,
            supports_ios,
        });
    }

    out
}

/// Entitlement keys live both on the capability's direct entitlements and
/// nested under settings options.
fn collect_profile_keys(attrs: &Value, out: &mut Vec<String>) {
    for ent in attrs
        .get("entitlements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(key) = ent.get("profileKey").and_then(Value::as_str) {
            out.push(key.to_string());
        }
    }

    for setting in attrs
        .get("settings")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for option in setting
            .get("options")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for ent in option
                .get("entitlements")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(key) = ent.get("profileKey").and_then(Value::as_str) {
                    out.push(key.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_capability_listing() {
        let body = json!({
            "data": [
                {
                    "id": "PUSH_NOTIFICATIONS",
                    "attributes": {
                        "name": "Push Notifications",
                        "optional": true,
                        "editable": true,
                        "entitlements": [
                            { "profileKey": "aps-environment" }
                        ],
                        "settings": [
                            {
                                "options": [
                                    { "entitlements": [{ "profileKey": "com.apple.developer.aps-environment" }] }
                                ]
                            }
                        ],
                        "supportedSDKs": [{ "displayValue": "iOS" }],
                        "distributionTypes": [
                            { "displayValue": "Development" },
                            { "displayValue": "Ad hoc" }
                        ]
                    }
                }
            ]
        });

        let caps = parse_available_capabilities(&body);
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].id, "PUSH_NOTIFICATIONS");
        assert!(caps[0].supports_ios);
        assert_eq!(
            caps[0].profile_keys,
            vec!["aps-environment", "com.apple.developer.aps-environment"]
        );
        assert_eq!(caps[0].distribution_types, vec!["Development", "Ad hoc"]);
    }

    #[test]
    fn settings_defaults_cover_icloud_and_push() {
        assert!(capability_settings("ICLOUD").as_array().map(|a| !a.is_empty()).unwrap());
        assert!(capability_settings("PUSH_NOTIFICATIONS")
            .as_array()
            .map(|a| !a.is_empty())
            .unwrap());
        assert!(capability_settings("GAME_CENTER").as_array().map(|a| a.is_empty()).unwrap());
    }

    #[test]
    fn relationship_capabilities_are_mapped() {
        let rel = CapabilityRelationships {
            app_group_ids: vec!["G1".into()],
            cloud_container_ids: vec!["C1".into()],
        };
        assert_eq!(relationship_payload("APP_GROUPS", &rel).unwrap().0, "appGroups");
        assert_eq!(relationship_payload("ICLOUD", &rel).unwrap().0, "cloudContainers");
        assert!(relationship_payload("SIRI", &rel).is_none());
    }
}
