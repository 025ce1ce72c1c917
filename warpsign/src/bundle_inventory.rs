// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App bundle discovery.
//!
//! Walks an extracted `.app` directory and produces a flat arena of
//! bundle records; nesting is expressed through indices, never through
//! owned references, so plans can point back at bundles without cycles.
//!
//! Primary bundles (apps, extensions, watch apps, app clips) get their
//! own identifier, entitlements and provisioning profile. Auxiliary
//! images (frameworks, dylibs, loose plugin bundles) only need their
//! signature replaced.

use {
    crate::{
        error::{Result, WarpSignError},
        macho_rewriting::MachImage,
        plist_io,
    },
    log::{debug, info, warn},
    plist::{Dictionary, Value},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
};

/// Index of a bundle in the inventory arena.
pub type BundleIndex = usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundleKind {
    App,
    Extension,
    Framework,
    WatchApp,
    AppClip,
    Dylib,
    Plugin,
}

impl BundleKind {
    /// Primary bundles carry an identifier registered on the portal and
    /// receive a provisioning profile.
    pub fn is_primary(self) -> bool {
        matches!(self, Self::App | Self::Extension | Self::WatchApp | Self::AppClip)
    }
}

#[derive(Clone, Debug)]
pub struct Bundle {
    /// Bundle root (for dylibs, the file itself), absolute.
    pub root: PathBuf,
    /// Path relative to the app root; empty for the app itself.
    pub relative_path: PathBuf,
    pub kind: BundleKind,
    /// Original bundle identifier (executable stem for auxiliary images).
    pub identifier: String,
    pub display_name: String,
    /// Main executable, absolute.
    pub executable: PathBuf,
    /// Entitlements extracted from the executable's embedded signature.
    pub entitlements: Dictionary,
    pub parent: Option<BundleIndex>,
    pub children: Vec<BundleIndex>,
    /// Nesting depth; the app root is 0.
    pub depth: usize,
}

impl Bundle {
    /// Path shown in progress output; `.` for the app root.
    pub fn relative_display(&self) -> String {
        if self.relative_path.as_os_str().is_empty() {
            ".".to_string()
        } else {
            self.relative_path.display().to_string()
        }
    }
}

#[derive(Debug)]
pub struct BundleInventory {
    bundles: Vec<Bundle>,
}

impl BundleInventory {
    /// Scan the extracted app at `app_root`.
    pub fn scan(app_root: &Path) -> Result<Self> {
        let mut inventory = Self { bundles: Vec::new() };
        let mut visited = BTreeSet::new();

        let root = inventory.scan_bundle(app_root, app_root, None, 0, &mut visited)?;
        debug_assert_eq!(root, 0);

        info!(
            "inventory: {} bundle(s), {} primary",
            inventory.bundles.len(),
            inventory.primaries().count()
        );
        Ok(inventory)
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn get(&self, index: BundleIndex) -> &Bundle {
        &self.bundles[index]
    }

    pub fn root(&self) -> &Bundle {
        &self.bundles[0]
    }

    pub fn primaries(&self) -> impl Iterator<Item = BundleIndex> + '_ {
        self.bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.kind.is_primary())
            .map(|(i, _)| i)
    }

    /// Indices in signing order: deepest bundles first, stable within a
    /// depth level. A parent is never signed before all its descendants.
    pub fn signing_order(&self) -> Vec<BundleIndex> {
        let mut order: Vec<BundleIndex> = (0..self.bundles.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.bundles[i].depth));
        order
    }

    /// Every Apple team id mentioned by the app's entitlements, sorted.
    /// Apps re-signed from several sources can carry more than one.
    pub fn original_team_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();

        for bundle in &self.bundles {
            harvest_team_ids(&bundle.entitlements, &mut ids);
        }

        ids.into_iter().collect()
    }

    fn scan_bundle(
        &mut self,
        app_root: &Path,
        bundle_root: &Path,
        parent: Option<BundleIndex>,
        depth: usize,
        visited: &mut BTreeSet<PathBuf>,
    ) -> Result<BundleIndex> {
        let canonical = bundle_root.canonicalize()?;
        if !visited.insert(canonical) {
            return Err(WarpSignError::BundleLayout(format!(
                "bundle cycle detected at {}",
                bundle_root.display()
            )));
        }

        let kind = classify(bundle_root, depth)?;
        let record = if kind == BundleKind::Dylib {
            self.dylib_record(app_root, bundle_root, parent, depth)?
        } else {
            self.directory_record(app_root, bundle_root, kind, parent, depth)?
        };

        let index = self.bundles.len();
        self.bundles.push(record);

        if let Some(parent) = parent {
            self.bundles[parent].children.push(index);
        }

        if kind != BundleKind::Dylib {
            for nested in discover_nested(bundle_root)? {
                self.scan_bundle(app_root, &nested, Some(index), depth + 1, visited)?;
            }
        }

        Ok(index)
    }

    fn directory_record(
        &self,
        app_root: &Path,
        bundle_root: &Path,
        kind: BundleKind,
        parent: Option<BundleIndex>,
        depth: usize,
    ) -> Result<Bundle> {
        let info_path = bundle_root.join("Info.plist");
        let info = if info_path.is_file() {
            Some(plist_io::load_dictionary(&info_path)?)
        } else {
            None
        };

        let stem = bundle_root
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let identifier = info
            .as_ref()
            .and_then(|i| i.get("CFBundleIdentifier"))
            .and_then(Value::as_string)
            .map(|s| s.to_string())
            .unwrap_or_else(|| stem.clone());

        if identifier.contains('*') {
            return Err(WarpSignError::WildcardIdentifier(identifier));
        }

        let display_name = info
            .as_ref()
            .and_then(|i| {
                i.get("CFBundleDisplayName")
                    .or_else(|| i.get("CFBundleName"))
            })
            .and_then(Value::as_string)
            .map(|s| s.to_string())
            .unwrap_or_else(|| stem.clone());

        let executable_name = info
            .as_ref()
            .and_then(|i| i.get("CFBundleExecutable"))
            .and_then(Value::as_string)
            .map(|s| s.to_string())
            .unwrap_or_else(|| stem.clone());

        let executable = bundle_root.join(&executable_name);
        if kind.is_primary() && !executable.is_file() {
            return Err(WarpSignError::BundleLayout(format!(
                "bundle {} names executable {executable_name} but it is missing",
                bundle_root.display()
            )));
        }

        let entitlements = read_entitlements(&executable);

        debug!(
            "bundle {:?} {} ({})",
            kind,
            identifier,
            bundle_root.display()
        );

        Ok(Bundle {
            root: bundle_root.to_path_buf(),
            relative_path: relative_to(app_root, bundle_root),
            kind,
            identifier,
            display_name,
            executable,
            entitlements,
            parent,
            children: Vec::new(),
            depth,
        })
    }

    fn dylib_record(
        &self,
        app_root: &Path,
        dylib: &Path,
        parent: Option<BundleIndex>,
        depth: usize,
    ) -> Result<Bundle> {
        let stem = dylib
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Bundle {
            root: dylib.to_path_buf(),
            relative_path: relative_to(app_root, dylib),
            kind: BundleKind::Dylib,
            identifier: stem.clone(),
            display_name: stem,
            executable: dylib.to_path_buf(),
            entitlements: read_entitlements(dylib),
            parent,
            children: Vec::new(),
            depth,
        })
    }
}

fn relative_to(app_root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(app_root)
        .map(|p| p.to_path_buf())
        .unwrap_or_default()
}

fn read_entitlements(executable: &Path) -> Dictionary {
    if !executable.is_file() {
        return Dictionary::new();
    }

    match MachImage::open(executable) {
        Ok(image) => image.entitlements().unwrap_or_default(),
        Err(err) => {
            warn!(
                "could not read entitlements from {}: {err}",
                executable.display()
            );
            Dictionary::new()
        }
    }
}

fn classify(path: &Path, depth: usize) -> Result<BundleKind> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let kind = match extension.as_str() {
        "app" if depth == 0 => BundleKind::App,
        "app" => {
            // Nested apps are watch apps or app clips depending on where
            // they live.
            let parent_dir = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if parent_dir == "AppClips" {
                BundleKind::AppClip
            } else {
                BundleKind::WatchApp
            }
        }
        "appex" => BundleKind::Extension,
        "framework" => BundleKind::Framework,
        "dylib" => BundleKind::Dylib,
        "bundle" => BundleKind::Plugin,
        other => {
            return Err(WarpSignError::BundleLayout(format!(
                "unrecognized bundle extension .{other} at {}",
                path.display()
            )))
        }
    };

    Ok(kind)
}

/// Directories that can hold nested signable bundles.
const NESTED_DIRS: &[&str] = &["Frameworks", "PlugIns", "Watch", "AppClips", "Extensions"];

fn discover_nested(bundle_root: &Path) -> Result<Vec<PathBuf>> {
    let mut nested = Vec::new();

    for dir_name in NESTED_DIRS {
        let dir = bundle_root.join(dir_name);
        if !dir.is_dir() {
            continue;
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for entry in entries {
            let is_dylib = entry.is_file()
                && entry.extension().map(|e| e == "dylib").unwrap_or(false);
            let is_bundle_dir = entry.is_dir()
                && entry
                    .extension()
                    .map(|e| {
                        matches!(
                            e.to_string_lossy().as_ref(),
                            "app" | "appex" | "framework" | "bundle"
                        )
                    })
                    .unwrap_or(false);

            if is_dylib || is_bundle_dir {
                nested.push(entry);
            }
        }
    }

    Ok(nested)
}

fn harvest_team_ids(entitlements: &Dictionary, out: &mut BTreeSet<String>) {
    if let Some(team_id) = entitlements
        .get("com.apple.developer.team-identifier")
        .and_then(Value::as_string)
    {
        if is_team_id(team_id) {
            out.insert(team_id.to_string());
        }
    }

    if let Some(app_id) = entitlements
        .get("application-identifier")
        .and_then(Value::as_string)
    {
        if let Some(prefix) = app_id.split('.').next() {
            if is_team_id(prefix) {
                out.insert(prefix.to_string());
            }
        }
    }

    if let Some(Value::Array(groups)) = entitlements.get("keychain-access-groups") {
        for group in groups {
            if let Some(group) = group.as_string() {
                if let Some(prefix) = group.split('.').next() {
                    if is_team_id(prefix) {
                        out.insert(prefix.to_string());
                    }
                }
            }
        }
    }
}

/// Apple team ids are exactly ten alphanumerics.
pub fn is_team_id(candidate: &str) -> bool {
    candidate.len() == 10 && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}
