// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The entitlement-key to portal-capability map.
//!
//! Apple versions this list server-side, so the map is a value, not a
//! constant: it starts from a built-in table, merges whatever the portal
//! advertises for the account at run time, and finally applies the
//! operator's `capabilities.toml` overrides. Lookups never consult the
//! built-in table directly.

use {
    crate::entitlement_reconciling::ProfileEnvironment,
    developer_portal::AvailableCapability,
    log::{debug, warn},
    serde::Deserialize,
    std::{
        collections::{BTreeMap, BTreeSet},
        path::Path,
    },
};

/// Entitlement keys whose values reference portal-registered app groups.
pub const APP_GROUP_KEYS: &[&str] = &[
    "com.apple.security.application-groups",
    "application-groups",
];

/// Entitlement keys whose values reference iCloud containers.
pub const ICLOUD_CONTAINER_KEYS: &[&str] = &[
    "com.apple.developer.icloud-container-identifiers",
    "com.apple.developer.ubiquity-container-identifiers",
    "com.apple.developer.icloud-container-development-container-identifiers",
];

pub const KEYCHAIN_GROUPS_KEY: &str = "keychain-access-groups";
pub const UBIQUITY_KVSTORE_KEY: &str = "com.apple.developer.ubiquity-kvstore-identifier";
pub const APPLICATION_IDENTIFIER_KEY: &str = "application-identifier";
pub const TEAM_IDENTIFIER_KEY: &str = "com.apple.developer.team-identifier";
pub const GET_TASK_ALLOW_KEY: &str = "get-task-allow";
pub const APS_ENVIRONMENT_KEY: &str = "aps-environment";

/// Capability id the portal uses for push.
pub const PUSH_CAPABILITY_ID: &str = "PUSH_NOTIFICATIONS";
pub const APP_GROUPS_CAPABILITY_ID: &str = "APP_GROUPS";
pub const ICLOUD_CAPABILITY_ID: &str = "ICLOUD";

/// Entitlement keys stripped before anything else is considered. These
/// are either re-derived by the reconciler or revoked by Apple for
/// re-signed apps.
const BANNED_KEYS: &[&str] = &["com.apple.developer.in-app-payments"];

/// Built-in key -> capability table. A snapshot of what the portal
/// recognises; the live listing and the override file both take
/// precedence.
const DEFAULT_TABLE: &[(&str, &str)] = &[
    ("aps-environment", "PUSH_NOTIFICATIONS"),
    ("com.apple.developer.aps-environment", "PUSH_NOTIFICATIONS"),
    ("com.apple.security.application-groups", "APP_GROUPS"),
    ("com.apple.developer.icloud-services", "ICLOUD"),
    ("com.apple.developer.icloud-container-identifiers", "ICLOUD"),
    ("com.apple.developer.icloud-container-environment", "ICLOUD"),
    (
        "com.apple.developer.icloud-container-development-container-identifiers",
        "ICLOUD",
    ),
    ("com.apple.developer.ubiquity-container-identifiers", "ICLOUD"),
    ("com.apple.developer.ubiquity-kvstore-identifier", "ICLOUD"),
    ("com.apple.developer.networking.HotspotConfiguration", "HOT_SPOT"),
    ("com.apple.developer.nfc.readersession.formats", "NFC_TAG_READING"),
    ("com.apple.developer.healthkit", "HEALTHKIT"),
    ("com.apple.developer.healthkit.access", "HEALTHKIT"),
    ("com.apple.developer.healthkit.background-delivery", "HEALTHKIT"),
    ("com.apple.developer.homekit", "HOMEKIT"),
    ("com.apple.developer.siri", "SIRIKIT"),
    ("com.apple.developer.pass-type-identifiers", "WALLET"),
    ("com.apple.developer.game-center", "GAME_CENTER"),
    ("com.apple.developer.in-app-payments", "APPLE_PAY"),
    ("com.apple.developer.associated-domains", "ASSOCIATED_DOMAINS"),
    ("com.apple.developer.group-session", "GROUP_ACTIVITIES"),
    ("com.apple.developer.networking.multipath", "MULTIPATH"),
    ("com.apple.developer.networking.networkextension", "NETWORK_EXTENSIONS"),
    ("com.apple.developer.networking.vpn.api", "PERSONAL_VPN"),
    ("inter-app-audio", "INTER_APP_AUDIO"),
    (
        "com.apple.developer.authentication-services.autofill-credential-provider",
        "AUTOFILL_CREDENTIAL_PROVIDER",
    ),
    ("com.apple.developer.ClassKit-environment", "CLASSKIT"),
    (
        "com.apple.developer.kernel.extended-virtual-addressing",
        "EXTENDED_VIRTUAL_ADDRESSING",
    ),
    ("com.apple.developer.family-controls", "FAMILY_CONTROLS"),
    ("com.apple.developer.driverkit", "DRIVERKIT"),
    ("com.apple.developer.default-data-protection", "DATA_PROTECTION"),
    ("com.apple.developer.applesignin", "APPLE_ID_AUTH"),
    ("com.apple.developer.networking.wifi-info", "ACCESS_WIFI_INFORMATION"),
    ("com.apple.developer.usernotifications.communication", "USERNOTIFICATIONS_COMMUNICATION"),
    ("com.apple.developer.usernotifications.time-sensitive", "USERNOTIFICATIONS_TIMESENSITIVE"),
    ("com.apple.developer.user-fonts", "FONTS"),
    ("com.apple.developer.devicecheck.appattest-environment", "APP_ATTEST"),
    ("com.apple.external-accessory.wireless-configuration", "WIRELESS_ACCESSORY_CONFIGURATION"),
    ("com.apple.developer.kernel.increased-memory-limit", "INCREASED_MEMORY_LIMIT"),
    ("com.apple.developer.push-to-talk", "PUSH_TO_TALK"),
    ("com.apple.developer.shared-with-you", "SHARED_WITH_YOU"),
    ("com.apple.developer.weatherkit", "WEATHERKIT"),
    ("com.apple.developer.journal.allow", "JOURNALING"),
];

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    capabilities: BTreeMap<String, String>,
}

/// Resolved entitlement-key -> capability mapping for one run.
#[derive(Clone, Debug)]
pub struct CapabilityMap {
    by_entitlement: BTreeMap<String, String>,
    banned: BTreeSet<String>,
    /// Capability ids the team can actually enable for the chosen
    /// distribution type. Empty means "unknown" (offline), which gates
    /// nothing.
    team_enabled: BTreeSet<String>,
}

impl CapabilityMap {
    pub fn builtin() -> Self {
        Self {
            by_entitlement: DEFAULT_TABLE
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            banned: BANNED_KEYS.iter().map(|s| s.to_string()).collect(),
            team_enabled: BTreeSet::new(),
        }
    }

    /// Fold in what the portal advertises for this account. The listing
    /// also tells us which capabilities the chosen certificate kind can
    /// use, which is what gates stripping.
    pub fn merge_portal(
        &mut self,
        available: &[AvailableCapability],
        environment: ProfileEnvironment,
    ) {
        let wanted_distribution = match environment {
            ProfileEnvironment::Development => "Development",
            ProfileEnvironment::Production => "Ad hoc",
        };

        for capability in available {
            if !capability.supports_ios {
                continue;
            }

            let supported = capability
                .distribution_types
                .iter()
                .any(|d| d == wanted_distribution);
            if supported {
                self.team_enabled.insert(capability.id.clone());
            }

            for key in &capability.profile_keys {
                self.by_entitlement
                    .entry(key.clone())
                    .or_insert_with(|| capability.id.clone());
            }
        }

        debug!(
            "capability map: {} keys, {} team-enabled capabilities",
            self.by_entitlement.len(),
            self.team_enabled.len()
        );
    }

    /// Apply `capabilities.toml` overrides from the config directory.
    /// The file maps entitlement keys to capability ids; an empty value
    /// removes a mapping.
    pub fn merge_overrides(&mut self, path: &Path) {
        if !path.is_file() {
            return;
        }

        let parsed: OverrideFile = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| toml::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("ignoring malformed {}: {err}", path.display());
                return;
            }
        };

        for (key, capability) in parsed.capabilities {
            if capability.is_empty() {
                self.by_entitlement.remove(&key);
            } else {
                self.by_entitlement.insert(key, capability);
            }
        }
    }

    /// The portal capability gating `key`, when there is one.
    pub fn capability_for(&self, key: &str) -> Option<&str> {
        self.by_entitlement.get(key).map(|s| s.as_str())
    }

    pub fn is_banned(&self, key: &str) -> bool {
        self.banned.contains(key)
    }

    /// Whether the team can enable `capability` at all. With no portal
    /// listing merged in, everything passes.
    pub fn team_can_enable(&self, capability: &str) -> bool {
        self.team_enabled.is_empty() || self.team_enabled.contains(capability)
    }

    pub fn is_app_group_key(key: &str) -> bool {
        APP_GROUP_KEYS.contains(&key)
    }

    pub fn is_icloud_container_key(key: &str) -> bool {
        ICLOUD_CONTAINER_KEYS.contains(&key)
    }
}
