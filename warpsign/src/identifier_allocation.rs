// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic identifier mapping.
//!
//! Every original bundle identifier maps to `<prefix>.<flattened-id>`,
//! where the prefix defaults to a hash of the original root identifier
//! and the team id, so re-runs allocate the same identifiers and portal
//! state gets reused instead of duplicated.
//!
//! Nested bundles whose original identifier extends their parent's keep
//! the relation: the child maps to `<parent-new>.<flattened-suffix>`.
//! App groups and iCloud containers get their own shapes, and keychain
//! groups only re-seat the team prefix.

use {
    crate::{
        error::{Result, WarpSignError},
        macho_rewriting::Replacement,
    },
    log::debug,
    sha2::{Digest, Sha256},
    std::collections::BTreeMap,
};

/// Apple's ceiling for a bundle identifier, in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

pub struct IdentifierAllocator {
    team_id: String,
    prefix: String,
    force_original: bool,
    original_team_ids: Vec<String>,
    mappings: BTreeMap<String, String>,
}

impl IdentifierAllocator {
    pub fn new(
        team_id: &str,
        root_identifier: &str,
        prefix: Option<&str>,
        force_original: bool,
        original_team_ids: Vec<String>,
    ) -> Self {
        let prefix = prefix
            .map(|p| p.to_string())
            .unwrap_or_else(|| default_prefix(root_identifier, team_id));

        Self {
            team_id: team_id.to_string(),
            prefix,
            force_original,
            original_team_ids,
            mappings: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn force_original(&self) -> bool {
        self.force_original
    }

    /// Map a bundle identifier. `parent` carries the original and mapped
    /// identifier of the enclosing bundle so prefixal relations survive.
    pub fn map_bundle(
        &mut self,
        original: &str,
        parent: Option<(&str, &str)>,
    ) -> Result<String> {
        if let Some(mapped) = self.mappings.get(original) {
            return Ok(mapped.clone());
        }

        let mapped = if self.force_original {
            original.to_string()
        } else if let Some((parent_original, parent_new)) = parent {
            match prefix_suffix(parent_original, original) {
                Some(suffix) => format!("{parent_new}.{}", flatten(suffix)),
                None => format!("{}.{}", self.prefix, flatten(original)),
            }
        } else {
            format!("{}.{}", self.prefix, flatten(original))
        };

        check_registrable(&mapped)?;

        // A mapped child must still extend its mapped parent.
        if let Some((parent_original, parent_new)) = parent {
            if prefix_suffix(parent_original, original).is_some()
                && prefix_suffix(parent_new, &mapped).is_none()
            {
                return Err(WarpSignError::NestedIdentifierMismatch {
                    parent: parent_new.to_string(),
                    child: mapped,
                });
            }
        }

        debug!("identifier {original} -> {mapped}");
        self.mappings.insert(original.to_string(), mapped.clone());
        Ok(mapped)
    }

    /// Map an app group identifier (`group.<...>`).
    pub fn map_app_group(&mut self, original: &str) -> Result<String> {
        if let Some(mapped) = self.mappings.get(original) {
            return Ok(mapped.clone());
        }

        let rest = original.strip_prefix("group.").unwrap_or(original);

        // Strip an embedded team id so re-signed groups don't carry the
        // previous team's prefix.
        let rest = self
            .original_team_ids
            .iter()
            .find_map(|tid| rest.strip_prefix(tid.as_str()))
            .map(|r| r.trim_start_matches('.'))
            .unwrap_or(rest);

        let mapped = format!("group.{}.{}", self.prefix, flatten(rest));
        check_registrable(&mapped)?;

        debug!("app group {original} -> {mapped}");
        self.mappings.insert(original.to_string(), mapped.clone());
        Ok(mapped)
    }

    /// Map an iCloud container identifier. Containers follow the owning
    /// bundle's new identifier unless pinned by the caller.
    pub fn map_icloud_container(
        &mut self,
        original: &str,
        owner_new_identifier: &str,
        pin: bool,
    ) -> Result<String> {
        if pin {
            return Ok(original.to_string());
        }

        if let Some(mapped) = self.mappings.get(original) {
            return Ok(mapped.clone());
        }

        let mapped = format!("iCloud.{owner_new_identifier}");
        check_registrable(&mapped)?;

        debug!("iCloud container {original} -> {mapped}");
        self.mappings.insert(original.to_string(), mapped.clone());
        Ok(mapped)
    }

    /// Re-seat a keychain access group onto the new team.
    pub fn map_keychain_group(&self, original: &str) -> String {
        for team_id in &self.original_team_ids {
            if let Some(rest) = original.strip_prefix(team_id.as_str()) {
                return format!("{}{rest}", self.team_id);
            }
        }
        format!("{}.{original}", self.team_id)
    }

    pub fn mappings(&self) -> &BTreeMap<String, String> {
        &self.mappings
    }

    /// Patches safe to apply to raw binaries: identical byte length
    /// only. Team-id swaps come first, then registered identifier
    /// mappings, longest pattern first so no partial match fires early.
    pub fn equal_length_replacements(&self) -> Vec<Replacement> {
        let mut replacements = Vec::new();

        for original_team in &self.original_team_ids {
            if original_team.len() == self.team_id.len() && *original_team != self.team_id {
                replacements.push(Replacement {
                    old: original_team.clone(),
                    new: self.team_id.clone(),
                });
            }
        }

        for (original, mapped) in &self.mappings {
            if original.len() == mapped.len() && original != mapped {
                replacements.push(Replacement {
                    old: original.clone(),
                    new: mapped.clone(),
                });
            }
        }

        replacements.sort_by(|a, b| b.old.len().cmp(&a.old.len()).then(a.old.cmp(&b.old)));
        replacements
    }
}

/// `wsXXXXXXXXXX`: a stable function of the app and the team, so two
/// runs of the same input agree on every identifier.
pub fn default_prefix(root_identifier: &str, team_id: &str) -> String {
    let digest = Sha256::digest(format!("{root_identifier}:{team_id}").as_bytes());
    format!("ws{}", &hex::encode(digest)[..10])
}

/// Collapse an identifier into a single label: anything outside
/// `[A-Za-z0-9-]` becomes `-`.
fn flatten(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// `child = parent + "." + suffix` -> Some(suffix).
fn prefix_suffix<'a>(parent: &str, child: &'a str) -> Option<&'a str> {
    child
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|suffix| !suffix.is_empty())
}

/// Enforced before any portal mutation happens.
pub fn check_registrable(identifier: &str) -> Result<()> {
    let length = identifier.len();
    if length > MAX_IDENTIFIER_LENGTH {
        return Err(WarpSignError::IdentifierTooLong {
            identifier: identifier.to_string(),
            length,
            limit: MAX_IDENTIFIER_LENGTH,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> IdentifierAllocator {
        IdentifierAllocator::new(
            "TEAM123456",
            "com.example.hello",
            Some("ws0011aabb"),
            false,
            vec!["OLDTEAM123".into()],
        )
    }

    #[test]
    fn flattens_root_identifier() {
        let mut alloc = allocator();
        let mapped = alloc.map_bundle("com.example.hello", None).unwrap();
        assert_eq!(mapped, "ws0011aabb.com-example-hello");
    }

    #[test]
    fn child_keeps_prefix_relation() {
        let mut alloc = allocator();
        let parent = alloc.map_bundle("com.acme.app", None).unwrap();
        let child = alloc
            .map_bundle("com.acme.app.share", Some(("com.acme.app", &parent)))
            .unwrap();

        assert_eq!(parent, "ws0011aabb.com-acme-app");
        assert_eq!(child, "ws0011aabb.com-acme-app.share");
        assert!(child.starts_with(&format!("{parent}.")));
    }

    #[test]
    fn unrelated_child_maps_standalone() {
        let mut alloc = allocator();
        let parent = alloc.map_bundle("com.acme.app", None).unwrap();
        let other = alloc
            .map_bundle("com.vendor.widget", Some(("com.acme.app", &parent)))
            .unwrap();
        assert_eq!(other, "ws0011aabb.com-vendor-widget");
    }

    #[test]
    fn mapping_is_deterministic_and_cached() {
        let mut a = allocator();
        let mut b = allocator();
        assert_eq!(
            a.map_bundle("com.x.y", None).unwrap(),
            b.map_bundle("com.x.y", None).unwrap()
        );
        let first = a.map_bundle("com.x.y", None).unwrap();
        assert_eq!(first, a.map_bundle("com.x.y", None).unwrap());
    }

    #[test]
    fn default_prefix_is_stable() {
        let p1 = default_prefix("com.example.hello", "TEAM123456");
        let p2 = default_prefix("com.example.hello", "TEAM123456");
        let p3 = default_prefix("com.example.hello", "OTHERTEAM1");
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
        assert!(p1.starts_with("ws"));
        assert_eq!(p1.len(), 12);
    }

    #[test]
    fn force_original_preserves_identifiers() {
        let mut alloc = IdentifierAllocator::new(
            "TEAM123456",
            "com.example.hello",
            None,
            true,
            Vec::new(),
        );
        assert_eq!(
            alloc.map_bundle("com.example.hello", None).unwrap(),
            "com.example.hello"
        );
    }

    #[test]
    fn app_group_strips_old_team_and_prefixes() {
        let mut alloc = allocator();
        let mapped = alloc.map_app_group("group.OLDTEAM123.shared").unwrap();
        assert_eq!(mapped, "group.ws0011aabb.shared");

        let plain = alloc.map_app_group("group.com.acme.stuff").unwrap();
        assert_eq!(plain, "group.ws0011aabb.com-acme-stuff");
    }

    #[test]
    fn icloud_container_tracks_owner() {
        let mut alloc = allocator();
        let owner = alloc.map_bundle("com.acme.app", None).unwrap();
        let container = alloc
            .map_icloud_container("iCloud.com.acme.app", &owner, false)
            .unwrap();
        assert_eq!(container, format!("iCloud.{owner}"));

        let pinned = alloc
            .map_icloud_container("iCloud.com.acme.app", &owner, true)
            .unwrap();
        assert_eq!(pinned, "iCloud.com.acme.app");
    }

    #[test]
    fn keychain_group_reseats_team() {
        let alloc = allocator();
        assert_eq!(
            alloc.map_keychain_group("OLDTEAM123.com.acme.app"),
            "TEAM123456.com.acme.app"
        );
        assert_eq!(
            alloc.map_keychain_group("com.acme.shared"),
            "TEAM123456.com.acme.shared"
        );
    }

    #[test]
    fn length_ceiling_is_enforced() {
        let at_limit = "a".repeat(MAX_IDENTIFIER_LENGTH);
        assert!(check_registrable(&at_limit).is_ok());

        let over = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(matches!(
            check_registrable(&over),
            Err(WarpSignError::IdentifierTooLong { .. })
        ));
    }

    #[test]
    fn equal_length_replacements_cover_team_ids() {
        let mut alloc = allocator();
        alloc.map_bundle("com.acme.app", None).unwrap();

        let replacements = alloc.equal_length_replacements();
        assert!(replacements
            .iter()
            .any(|r| r.old == "OLDTEAM123" && r.new == "TEAM123456"));
        // Unequal-length bundle mapping must not appear.
        assert!(replacements.iter().all(|r| r.old.len() == r.new.len()));
    }
}
