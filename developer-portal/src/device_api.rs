// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{DeveloperPortalClient, PortalError},
    log::info,
    serde_json::Value,
};

const DEVICES_URL: &str = "https://developer.apple.com/services-account/v1/devices";

/// Device classes that can install an iOS provisioning profile.
const IOS_DEVICE_CLASSES: &[&str] = &["IPHONE", "IPAD"];

#[derive(Clone, Debug)]
pub struct Device {
    pub resource_id: String,
    pub name: String,
    pub udid: String,
    pub device_class: String,
    pub platform: String,
    pub model: Option<String>,
}

impl DeveloperPortalClient {
    /// Enabled iPhone/iPad devices registered on the team.
    pub fn list_devices(&self, team_id: &str) -> Result<Vec<Device>, PortalError> {
        self.ensure_authenticated()?;

        let request = self.v1_list_request(
            DEVICES_URL,
            "limit=1000&offset=0&filter[status]=ENABLED",
            team_id,
        );
        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "devices")?;

        let devices = body
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|d| {
                let attrs = d.get("attributes")?;
                let device_class = attrs.get("deviceClass")?.as_str()?.to_string();
                if !IOS_DEVICE_CLASSES.contains(&device_class.as_str()) {
                    return None;
                }

                Some(Device {
                    resource_id: d.get("id")?.as_str()?.to_string(),
                    name: attrs
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    udid: attrs.get("udid")?.as_str()?.to_string(),
                    device_class,
                    platform: attrs
                        .get("platform")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    model: attrs
                        .get("model")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                })
            })
            .collect::<Vec<_>>();

        info!("team {team_id} has {} enrolled iOS device(s)", devices.len());
        Ok(devices)
    }
}
