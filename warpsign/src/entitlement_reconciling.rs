// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entitlement reconciliation.
//!
//! Pure planning: given a bundle's declared entitlements, the capability
//! map, and the caller's flags, produce the signable entitlement set plus
//! the portal mutations that must land before signing. No I/O happens
//! here; the orchestrator applies the mutations through the portal client
//! and the same inputs always produce the same plan.
//!
//! Entitlements fall into three classes: capability-gated (kept only when
//! the team can enable the backing capability), identifier-coupled
//! (values rewritten through the allocator, with registrations emitted),
//! and free (copied, or stripped when unknown).

use {
    crate::{
        capabilities::{self, CapabilityMap},
        error::{Result, WarpSignError},
        identifier_allocation::IdentifierAllocator,
    },
    log::debug,
    plist::{Dictionary, Value},
    std::collections::BTreeSet,
};

/// Which `aps-environment` (and profile type) the chosen certificate
/// produces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProfileEnvironment {
    Development,
    Production,
}

impl ProfileEnvironment {
    pub fn aps_value(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Caller knobs that influence reconciliation.
#[derive(Clone, Debug, Default)]
pub struct ReconcileFlags {
    pub force_original_id: bool,
    pub pin_icloud_containers: bool,
    /// Pass unknown entitlements through instead of stripping them.
    pub keep_unknown: bool,
    /// Capabilities the caller insists on; losing one of these fails the
    /// run instead of producing a warning.
    pub required_capabilities: BTreeSet<String>,
}

/// A portal-side change the plan depends on. Applying a mutation twice
/// must be a no-op; the portal cache enforces that.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PortalMutation {
    RegisterAppGroup { identifier: String, name: String },
    RegisterCloudContainer { identifier: String, name: String },
    RegisterIdentifier { identifier: String, name: String },
    EnableCapabilities {
        identifier: String,
        capabilities: Vec<String>,
        app_groups: Vec<String>,
        cloud_containers: Vec<String>,
    },
}

/// The reconciler's output for one bundle.
#[derive(Clone, Debug)]
pub struct BundlePlan {
    pub original_identifier: String,
    pub new_identifier: String,
    /// Resolved entitlements, insertion-ordered.
    pub entitlements: Dictionary,
    /// Portal capability ids to enable on the identifier, sorted.
    pub capabilities: Vec<String>,
    /// Mutations in application order.
    pub mutations: Vec<PortalMutation>,
    pub warnings: Vec<String>,
}

pub struct ReconcileInput<'a> {
    pub declared: &'a Dictionary,
    pub original_identifier: &'a str,
    pub display_name: &'a str,
    /// Original and mapped identifier of the parent bundle, when nested.
    pub parent: Option<(&'a str, &'a str)>,
    pub environment: ProfileEnvironment,
    pub flags: &'a ReconcileFlags,
    pub map: &'a CapabilityMap,
}

pub fn reconcile(
    input: ReconcileInput<'_>,
    allocator: &mut IdentifierAllocator,
) -> Result<BundlePlan> {
    let new_identifier = allocator.map_bundle(input.original_identifier, input.parent)?;

    let mut entitlements = Dictionary::new();
    let mut capabilities: BTreeSet<String> = BTreeSet::new();
    let mut mutations = Vec::new();
    let mut warnings = Vec::new();

    // Declared keychain groups are folded into the derived set below.
    let declared_keychain: Vec<String> = match input.declared.get(capabilities::KEYCHAIN_GROUPS_KEY)
    {
        Some(Value::Array(groups)) => groups
            .iter()
            .filter_map(|g| g.as_string())
            .map(|g| allocator.map_keychain_group(g))
            .collect(),
        _ => Vec::new(),
    };

    for (key, value) in input.declared {
        match key.as_str() {
            // Re-derived below, never copied.
            capabilities::APPLICATION_IDENTIFIER_KEY
            | capabilities::TEAM_IDENTIFIER_KEY
            | capabilities::KEYCHAIN_GROUPS_KEY
            | capabilities::GET_TASK_ALLOW_KEY => continue,
            _ => {}
        }

        if input.map.is_banned(key) {
            warnings.push(format!("stripped banned entitlement {key}"));
            continue;
        }

        if key == capabilities::APS_ENVIRONMENT_KEY {
            entitlements.insert(
                key.clone(),
                Value::from(input.environment.aps_value()),
            );
            capabilities.insert(capabilities::PUSH_CAPABILITY_ID.to_string());
            continue;
        }

        if CapabilityMap::is_app_group_key(key) {
            let mut mapped_groups = Vec::new();
            for group in iter_strings(value) {
                let mapped = allocator.map_app_group(&group)?;
                push_unique(
                    &mut mutations,
                    PortalMutation::RegisterAppGroup {
                        identifier: mapped.clone(),
                        name: registration_name("App Group", &mapped),
                    },
                );
                mapped_groups.push(Value::from(mapped));
            }
            entitlements.insert(key.clone(), Value::Array(mapped_groups));
            capabilities.insert(capabilities::APP_GROUPS_CAPABILITY_ID.to_string());
            continue;
        }

        if CapabilityMap::is_icloud_container_key(key) {
            let mut mapped_containers = Vec::new();
            for container in iter_strings(value) {
                let mapped = allocator.map_icloud_container(
                    &container,
                    &new_identifier,
                    input.flags.pin_icloud_containers,
                )?;
                push_unique(
                    &mut mutations,
                    PortalMutation::RegisterCloudContainer {
                        identifier: mapped.clone(),
                        name: registration_name("iCloud Container", &mapped),
                    },
                );
                mapped_containers.push(Value::from(mapped));
            }
            entitlements.insert(key.clone(), Value::Array(mapped_containers));
            capabilities.insert(capabilities::ICLOUD_CAPABILITY_ID.to_string());
            continue;
        }

        if key == capabilities::UBIQUITY_KVSTORE_KEY {
            entitlements.insert(
                key.clone(),
                Value::from(format!("{}.{new_identifier}", allocator.team_id())),
            );
            capabilities.insert(capabilities::ICLOUD_CAPABILITY_ID.to_string());
            continue;
        }

        match input.map.capability_for(key) {
            Some(capability) => {
                if input.map.team_can_enable(capability) {
                    entitlements.insert(key.clone(), value.clone());
                    capabilities.insert(capability.to_string());
                } else if input.flags.required_capabilities.contains(capability) {
                    return Err(WarpSignError::CapabilityUnavailable {
                        capability: capability.to_string(),
                        entitlement: key.clone(),
                    });
                } else {
                    warnings.push(format!(
                        "stripped {key}: capability {capability} is not available to this team"
                    ));
                }
            }
            None if input.flags.keep_unknown => {
                entitlements.insert(key.clone(), value.clone());
            }
            None => {
                warnings.push(format!("stripped unknown entitlement {key}"));
            }
        }
    }

    // Derived entitlements.
    let team_id = allocator.team_id().to_string();
    entitlements.insert(
        capabilities::APPLICATION_IDENTIFIER_KEY.into(),
        Value::from(format!("{team_id}.{new_identifier}")),
    );
    entitlements.insert(
        capabilities::TEAM_IDENTIFIER_KEY.into(),
        Value::from(team_id.clone()),
    );

    let wildcard_group = format!("{team_id}.*");
    let mut keychain = vec![Value::from(wildcard_group.clone())];
    for group in declared_keychain {
        if group != wildcard_group {
            keychain.push(Value::from(group));
        }
    }
    entitlements.insert(
        capabilities::KEYCHAIN_GROUPS_KEY.into(),
        Value::Array(keychain),
    );

    // Development signing implies debuggability; the profile would be
    // rejected at install otherwise.
    if input.environment == ProfileEnvironment::Development {
        entitlements.insert(capabilities::GET_TASK_ALLOW_KEY.into(), Value::from(true));
    }

    let capabilities: Vec<String> = capabilities.into_iter().collect();

    mutations.push(PortalMutation::RegisterIdentifier {
        identifier: new_identifier.clone(),
        name: format!("WS {}", input.display_name),
    });

    if !capabilities.is_empty() {
        let app_groups = collect_registered(&mutations, |m| match m {
            PortalMutation::RegisterAppGroup { identifier, .. } => Some(identifier.clone()),
            _ => None,
        });
        let cloud_containers = collect_registered(&mutations, |m| match m {
            PortalMutation::RegisterCloudContainer { identifier, .. } => Some(identifier.clone()),
            _ => None,
        });

        mutations.push(PortalMutation::EnableCapabilities {
            identifier: new_identifier.clone(),
            capabilities: capabilities.clone(),
            app_groups,
            cloud_containers,
        });
    }

    debug!(
        "plan for {}: {} entitlement(s), {} capability(ies), {} mutation(s)",
        input.original_identifier,
        entitlements.len(),
        capabilities.len(),
        mutations.len()
    );

    Ok(BundlePlan {
        original_identifier: input.original_identifier.to_string(),
        new_identifier,
        entitlements,
        capabilities,
        mutations,
        warnings,
    })
}

fn iter_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_string())
            .map(|s| s.to_string())
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn push_unique(mutations: &mut Vec<PortalMutation>, mutation: PortalMutation) {
    if !mutations.contains(&mutation) {
        mutations.push(mutation);
    }
}

fn collect_registered(
    mutations: &[PortalMutation],
    select: impl Fn(&PortalMutation) -> Option<String>,
) -> Vec<String> {
    mutations.iter().filter_map(select).collect()
}

fn registration_name(kind: &str, identifier: &str) -> String {
    format!("WS {kind} {}", identifier.replace('.', " "))
}
