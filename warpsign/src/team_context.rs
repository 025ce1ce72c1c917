// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The team-side view of a signing run.
//!
//! [TeamContext] caches the portal's resource graph (identifiers, app
//! groups, containers, devices, profiles) for one team. Mutations go
//! through [TeamContext::apply_mutation], which performs the portal call
//! first and updates the cache only on success, so cache and portal never
//! disagree and re-applying a mutation is a no-op.
//!
//! [PortalOps] is the seam between the pipeline and the network: the real
//! client implements it by delegation, tests implement it in memory.

use {
    crate::{
        entitlement_reconciling::{PortalMutation, ProfileEnvironment},
        error::Result,
    },
    developer_portal::{
        AppGroup, AvailableCapability, BundleIdentifier, CapabilityRelationships, Certificate,
        CloudContainer, DeveloperPortalClient, Device, PortalError, ProfileKind,
    },
    log::{debug, info},
    std::collections::{BTreeMap, BTreeSet},
};

/// The portal operations the pipeline needs. Object-safe and `Sync` so
/// profile materialisation can fan out over scoped threads.
pub trait PortalOps: Sync {
    fn ensure_ready(&self) -> std::result::Result<(), PortalError>;
    fn list_identifiers(&self, team_id: &str)
        -> std::result::Result<Vec<BundleIdentifier>, PortalError>;
    fn register_identifier(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<BundleIdentifier, PortalError>;
    fn update_identifier_capabilities(
        &self,
        team_id: &str,
        resource_id: &str,
        identifier: &str,
        capabilities: &[String],
        relationships: &CapabilityRelationships,
    ) -> std::result::Result<(), PortalError>;
    fn list_app_groups(&self, team_id: &str) -> std::result::Result<Vec<AppGroup>, PortalError>;
    fn register_app_group(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<AppGroup, PortalError>;
    fn list_cloud_containers(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<CloudContainer>, PortalError>;
    fn register_cloud_container(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<CloudContainer, PortalError>;
    fn list_devices(&self, team_id: &str) -> std::result::Result<Vec<Device>, PortalError>;
    fn list_certificates(&self, team_id: &str)
        -> std::result::Result<Vec<Certificate>, PortalError>;
    fn list_available_capabilities(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<AvailableCapability>, PortalError>;
    fn create_profile(
        &self,
        team_id: &str,
        app_id_resource: &str,
        profile_name: &str,
        certificate_ids: &[String],
        device_ids: &[String],
        kind: ProfileKind,
    ) -> std::result::Result<Vec<u8>, PortalError>;
    fn transient_retries(&self) -> u32;
}

impl PortalOps for DeveloperPortalClient {
    fn ensure_ready(&self) -> std::result::Result<(), PortalError> {
        self.ensure_authenticated()
    }

    fn list_identifiers(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<BundleIdentifier>, PortalError> {
        DeveloperPortalClient::list_identifiers(self, team_id)
    }

    fn register_identifier(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<BundleIdentifier, PortalError> {
        DeveloperPortalClient::register_identifier(self, team_id, identifier, name)
    }

    fn update_identifier_capabilities(
        &self,
        team_id: &str,
        resource_id: &str,
        identifier: &str,
        capabilities: &[String],
        relationships: &CapabilityRelationships,
    ) -> std::result::Result<(), PortalError> {
        DeveloperPortalClient::update_identifier_capabilities(
            self,
            team_id,
            resource_id,
            identifier,
            capabilities,
            relationships,
        )
    }

    fn list_app_groups(&self, team_id: &str) -> std::result::Result<Vec<AppGroup>, PortalError> {
        DeveloperPortalClient::list_app_groups(self, team_id)
    }

    fn register_app_group(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<AppGroup, PortalError> {
        DeveloperPortalClient::register_app_group(self, team_id, identifier, name)
    }

    fn list_cloud_containers(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<CloudContainer>, PortalError> {
        DeveloperPortalClient::list_cloud_containers(self, team_id)
    }

    fn register_cloud_container(
        &self,
        team_id: &str,
        identifier: &str,
        name: &str,
    ) -> std::result::Result<CloudContainer, PortalError> {
        DeveloperPortalClient::register_cloud_container(self, team_id, identifier, name)
    }

    fn list_devices(&self, team_id: &str) -> std::result::Result<Vec<Device>, PortalError> {
        DeveloperPortalClient::list_devices(self, team_id)
    }

    fn list_certificates(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<Certificate>, PortalError> {
        DeveloperPortalClient::list_certificates(self, team_id)
    }

    fn list_available_capabilities(
        &self,
        team_id: &str,
    ) -> std::result::Result<Vec<AvailableCapability>, PortalError> {
        DeveloperPortalClient::list_available_capabilities(self, team_id)
    }

    fn create_profile(
        &self,
        team_id: &str,
        app_id_resource: &str,
        profile_name: &str,
        certificate_ids: &[String],
        device_ids: &[String],
        kind: ProfileKind,
    ) -> std::result::Result<Vec<u8>, PortalError> {
        DeveloperPortalClient::create_profile(
            self,
            team_id,
            app_id_resource,
            profile_name,
            certificate_ids,
            device_ids,
            kind,
        )
    }

    fn transient_retries(&self) -> u32 {
        DeveloperPortalClient::transient_retries(self)
    }
}

#[derive(Clone, Debug)]
struct RegisteredIdentifier {
    resource_id: String,
    capabilities: BTreeSet<String>,
}

/// Cached view of one team's portal state for the duration of a run.
pub struct TeamContext {
    pub team_id: String,
    pub certificate: Certificate,
    pub environment: ProfileEnvironment,
    identifiers: BTreeMap<String, RegisteredIdentifier>,
    app_groups: BTreeMap<String, String>,
    cloud_containers: BTreeMap<String, String>,
    devices: Vec<Device>,
    profiles: BTreeMap<String, Vec<u8>>,
}

impl TeamContext {
    /// Populate the cache from the portal.
    pub fn bootstrap(
        portal: &dyn PortalOps,
        team_id: &str,
        certificate: Certificate,
        environment: ProfileEnvironment,
    ) -> Result<Self> {
        let identifiers = portal
            .list_identifiers(team_id)?
            .into_iter()
            .map(|b| {
                (
                    b.identifier,
                    RegisteredIdentifier {
                        resource_id: b.resource_id,
                        // Capability sets are fetched lazily; an empty set
                        // forces the first enable to go to the portal.
                        capabilities: BTreeSet::new(),
                    },
                )
            })
            .collect();

        let app_groups = portal
            .list_app_groups(team_id)?
            .into_iter()
            .map(|g| (g.identifier, g.resource_id))
            .collect();

        let cloud_containers = portal
            .list_cloud_containers(team_id)?
            .into_iter()
            .map(|c| (c.identifier, c.resource_id))
            .collect();

        let devices = portal.list_devices(team_id)?;

        info!(
            "team {team_id}: certificate {}, {} device(s)",
            certificate.serial_number,
            devices.len()
        );

        Ok(Self {
            team_id: team_id.to_string(),
            certificate,
            environment,
            identifiers,
            app_groups,
            cloud_containers,
            devices,
            profiles: BTreeMap::new(),
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn identifier_resource(&self, identifier: &str) -> Option<&str> {
        self.identifiers
            .get(identifier)
            .map(|r| r.resource_id.as_str())
    }

    pub fn profile_bytes(&self, identifier: &str) -> Option<&[u8]> {
        self.profiles.get(identifier).map(|b| b.as_slice())
    }

    /// Apply one mutation. Returns true when the portal was actually
    /// touched; false means the cache already satisfied it.
    pub fn apply_mutation(
        &mut self,
        portal: &dyn PortalOps,
        mutation: &PortalMutation,
    ) -> Result<bool> {
        match mutation {
            PortalMutation::RegisterAppGroup { identifier, name } => {
                if self.app_groups.contains_key(identifier) {
                    debug!("app group {identifier} already registered; reusing");
                    return Ok(false);
                }
                let group = portal.register_app_group(&self.team_id, identifier, name)?;
                self.app_groups.insert(group.identifier, group.resource_id);
                Ok(true)
            }

            PortalMutation::RegisterCloudContainer { identifier, name } => {
                if self.cloud_containers.contains_key(identifier) {
                    debug!("iCloud container {identifier} already registered; reusing");
                    return Ok(false);
                }
                let container =
                    portal.register_cloud_container(&self.team_id, identifier, name)?;
                self.cloud_containers
                    .insert(container.identifier, container.resource_id);
                Ok(true)
            }

            PortalMutation::RegisterIdentifier { identifier, name } => {
                if self.identifiers.contains_key(identifier) {
                    debug!("identifier {identifier} already registered; reusing");
                    return Ok(false);
                }
                let registered = portal.register_identifier(&self.team_id, identifier, name)?;
                self.identifiers.insert(
                    registered.identifier,
                    RegisteredIdentifier {
                        resource_id: registered.resource_id,
                        capabilities: BTreeSet::new(),
                    },
                );
                Ok(true)
            }

            PortalMutation::EnableCapabilities {
                identifier,
                capabilities,
                app_groups,
                cloud_containers,
            } => {
                let record = self.identifiers.get(identifier).ok_or_else(|| {
                    PortalError::IdentifierConflict(format!(
                        "{identifier} must be registered before enabling capabilities"
                    ))
                })?;

                let wanted: BTreeSet<String> = capabilities.iter().cloned().collect();
                if record.capabilities.is_superset(&wanted) {
                    debug!("identifier {identifier} already has the required capabilities");
                    return Ok(false);
                }

                let relationships = CapabilityRelationships {
                    app_group_ids: self.resource_ids(&self.app_groups, app_groups),
                    cloud_container_ids: self
                        .resource_ids(&self.cloud_containers, cloud_containers),
                };

                let resource_id = record.resource_id.clone();
                portal.update_identifier_capabilities(
                    &self.team_id,
                    &resource_id,
                    identifier,
                    capabilities,
                    &relationships,
                )?;

                let record = self
                    .identifiers
                    .get_mut(identifier)
                    .expect("checked above");
                record.capabilities.extend(wanted);
                Ok(true)
            }
        }
    }

    fn resource_ids(
        &self,
        cache: &BTreeMap<String, String>,
        identifiers: &[String],
    ) -> Vec<String> {
        identifiers
            .iter()
            .filter_map(|id| cache.get(id).cloned())
            .collect()
    }

    /// Materialise (or fetch the cached) provisioning profile for
    /// `identifier` and return its bytes.
    pub fn ensure_profile(
        &mut self,
        portal: &dyn PortalOps,
        identifier: &str,
    ) -> Result<Vec<u8>> {
        if let Some(bytes) = self.profiles.get(identifier) {
            return Ok(bytes.clone());
        }

        let resource_id = self
            .identifier_resource(identifier)
            .ok_or_else(|| {
                PortalError::ProfileCreationFailed(format!(
                    "{identifier} is not registered; cannot create a profile"
                ))
            })?
            .to_string();

        let kind = match self.environment {
            ProfileEnvironment::Development => ProfileKind::Development,
            ProfileEnvironment::Production => ProfileKind::AdHoc,
        };

        let profile_name = format!("WS {identifier} {}", kind.label());
        let device_ids: Vec<String> = self
            .devices
            .iter()
            .map(|d| d.resource_id.clone())
            .collect();

        let bytes = portal.create_profile(
            &self.team_id,
            &resource_id,
            &profile_name,
            &[self.certificate.resource_id.clone()],
            &device_ids,
            kind,
        )?;

        self.profiles.insert(identifier.to_string(), bytes.clone());
        Ok(bytes)
    }

    /// Store an externally produced profile (used by the parallel
    /// materialisation phase).
    pub fn store_profile(&mut self, identifier: &str, bytes: Vec<u8>) {
        self.profiles.insert(identifier.to_string(), bytes);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory portal used by unit and integration tests.

    use super::*;
    use developer_portal::CertificateKind;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePortalState {
        pub identifiers: Vec<BundleIdentifier>,
        pub app_groups: Vec<AppGroup>,
        pub cloud_containers: Vec<CloudContainer>,
        pub capability_updates: Vec<(String, Vec<String>)>,
        pub profiles_created: Vec<String>,
        pub calls: Vec<String>,
    }

    pub struct FakePortal {
        pub state: Mutex<FakePortalState>,
        pub devices: Vec<Device>,
        pub available: Vec<AvailableCapability>,
    }

    impl FakePortal {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(FakePortalState::default()),
                devices: vec![Device {
                    resource_id: "DEV1".into(),
                    name: "Test iPhone".into(),
                    udid: "udid-1".into(),
                    device_class: "IPHONE".into(),
                    platform: "IOS".into(),
                    model: None,
                }],
                available: Vec::new(),
            }
        }

        pub fn certificate(kind: CertificateKind) -> Certificate {
            Certificate {
                resource_id: "CERT1".into(),
                serial_number: "00DEADBEEF".into(),
                name: match kind {
                    CertificateKind::Development => "Apple Development".into(),
                    CertificateKind::Distribution => "Apple Distribution".into(),
                },
                kind,
                expiration_date: None,
            }
        }

        fn log(&self, call: impl Into<String>) {
            self.state.lock().unwrap().calls.push(call.into());
        }
    }

    impl PortalOps for FakePortal {
        fn ensure_ready(&self) -> std::result::Result<(), PortalError> {
            self.log("ensure_ready");
            Ok(())
        }

        fn list_identifiers(
            &self,
            _team_id: &str,
        ) -> std::result::Result<Vec<BundleIdentifier>, PortalError> {
            Ok(self.state.lock().unwrap().identifiers.clone())
        }

        fn register_identifier(
            &self,
            _team_id: &str,
            identifier: &str,
            name: &str,
        ) -> std::result::Result<BundleIdentifier, PortalError> {
            self.log(format!("register_identifier:{identifier}"));
            let mut state = self.state.lock().unwrap();
            let record = BundleIdentifier {
                resource_id: format!("RID-{}", state.identifiers.len() + 1),
                identifier: identifier.to_string(),
                name: name.to_string(),
            };
            state.identifiers.push(record.clone());
            Ok(record)
        }

        fn update_identifier_capabilities(
            &self,
            _team_id: &str,
            _resource_id: &str,
            identifier: &str,
            capabilities: &[String],
            _relationships: &CapabilityRelationships,
        ) -> std::result::Result<(), PortalError> {
            self.log(format!("update_capabilities:{identifier}"));
            self.state
                .lock()
                .unwrap()
                .capability_updates
                .push((identifier.to_string(), capabilities.to_vec()));
            Ok(())
        }

        fn list_app_groups(
            &self,
            _team_id: &str,
        ) -> std::result::Result<Vec<AppGroup>, PortalError> {
            Ok(self.state.lock().unwrap().app_groups.clone())
        }

        fn register_app_group(
            &self,
            _team_id: &str,
            identifier: &str,
            name: &str,
        ) -> std::result::Result<AppGroup, PortalError> {
            self.log(format!("register_app_group:{identifier}"));
            let mut state = self.state.lock().unwrap();
            let group = AppGroup {
                resource_id: format!("GRP-{}", state.app_groups.len() + 1),
                identifier: identifier.to_string(),
                name: name.to_string(),
            };
            state.app_groups.push(group.clone());
            Ok(group)
        }

        fn list_cloud_containers(
            &self,
            _team_id: &str,
        ) -> std::result::Result<Vec<CloudContainer>, PortalError> {
            Ok(self.state.lock().unwrap().cloud_containers.clone())
        }

        fn register_cloud_container(
            &self,
            _team_id: &str,
            identifier: &str,
            name: &str,
        ) -> std::result::Result<CloudContainer, PortalError> {
            self.log(format!("register_cloud_container:{identifier}"));
            let mut state = self.state.lock().unwrap();
            let container = CloudContainer {
                resource_id: format!("CTR-{}", state.cloud_containers.len() + 1),
                identifier: identifier.to_string(),
                name: name.to_string(),
            };
            state.cloud_containers.push(container.clone());
            Ok(container)
        }

        fn list_devices(&self, _team_id: &str) -> std::result::Result<Vec<Device>, PortalError> {
            Ok(self.devices.clone())
        }

        fn list_certificates(
            &self,
            _team_id: &str,
        ) -> std::result::Result<Vec<Certificate>, PortalError> {
            Ok(vec![Self::certificate(CertificateKind::Development)])
        }

        fn list_available_capabilities(
            &self,
            _team_id: &str,
        ) -> std::result::Result<Vec<AvailableCapability>, PortalError> {
            Ok(self.available.clone())
        }

        fn create_profile(
            &self,
            _team_id: &str,
            _app_id_resource: &str,
            profile_name: &str,
            _certificate_ids: &[String],
            _device_ids: &[String],
            _kind: ProfileKind,
        ) -> std::result::Result<Vec<u8>, PortalError> {
            self.log(format!("create_profile:{profile_name}"));
            self.state
                .lock()
                .unwrap()
                .profiles_created
                .push(profile_name.to_string());
            Ok(format!("mobileprovision:{profile_name}").into_bytes())
        }

        fn transient_retries(&self) -> u32 {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::FakePortal, *};
    use developer_portal::CertificateKind;

    fn context(portal: &FakePortal) -> TeamContext {
        TeamContext::bootstrap(
            portal,
            "TEAM123456",
            FakePortal::certificate(CertificateKind::Development),
            ProfileEnvironment::Development,
        )
        .unwrap()
    }

    #[test]
    fn register_identifier_is_idempotent() {
        let portal = FakePortal::new();
        let mut ctx = context(&portal);

        let mutation = PortalMutation::RegisterIdentifier {
            identifier: "ws1.app".into(),
            name: "WS App".into(),
        };

        assert!(ctx.apply_mutation(&portal, &mutation).unwrap());
        assert!(!ctx.apply_mutation(&portal, &mutation).unwrap());

        let state = portal.state.lock().unwrap();
        assert_eq!(state.identifiers.len(), 1);
    }

    #[test]
    fn capabilities_require_registration_first() {
        let portal = FakePortal::new();
        let mut ctx = context(&portal);

        let enable = PortalMutation::EnableCapabilities {
            identifier: "ws1.app".into(),
            capabilities: vec!["PUSH_NOTIFICATIONS".into()],
            app_groups: vec![],
            cloud_containers: vec![],
        };
        assert!(ctx.apply_mutation(&portal, &enable).is_err());

        let register = PortalMutation::RegisterIdentifier {
            identifier: "ws1.app".into(),
            name: "WS App".into(),
        };
        ctx.apply_mutation(&portal, &register).unwrap();
        assert!(ctx.apply_mutation(&portal, &enable).unwrap());

        // Second application is a cache hit.
        assert!(!ctx.apply_mutation(&portal, &enable).unwrap());
    }

    #[test]
    fn capability_superset_is_reused() {
        let portal = FakePortal::new();
        let mut ctx = context(&portal);

        ctx.apply_mutation(
            &portal,
            &PortalMutation::RegisterIdentifier {
                identifier: "ws1.app".into(),
                name: "WS App".into(),
            },
        )
        .unwrap();

        ctx.apply_mutation(
            &portal,
            &PortalMutation::EnableCapabilities {
                identifier: "ws1.app".into(),
                capabilities: vec!["APP_GROUPS".into(), "PUSH_NOTIFICATIONS".into()],
                app_groups: vec![],
                cloud_containers: vec![],
            },
        )
        .unwrap();

        // A subset of the enabled capabilities requires no new call.
        let changed = ctx
            .apply_mutation(
                &portal,
                &PortalMutation::EnableCapabilities {
                    identifier: "ws1.app".into(),
                    capabilities: vec!["PUSH_NOTIFICATIONS".into()],
                    app_groups: vec![],
                    cloud_containers: vec![],
                },
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(portal.state.lock().unwrap().capability_updates.len(), 1);
    }

    #[test]
    fn profiles_are_cached_per_identifier() {
        let portal = FakePortal::new();
        let mut ctx = context(&portal);

        ctx.apply_mutation(
            &portal,
            &PortalMutation::RegisterIdentifier {
                identifier: "ws1.app".into(),
                name: "WS App".into(),
            },
        )
        .unwrap();

        let first = ctx.ensure_profile(&portal, "ws1.app").unwrap();
        let second = ctx.ensure_profile(&portal, "ws1.app").unwrap();
        assert_eq!(first, second);
        assert_eq!(portal.state.lock().unwrap().profiles_created.len(), 1);
    }
}
