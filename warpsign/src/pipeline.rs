// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The end-to-end signing pipeline.
//!
//! unpack -> inventory -> reconcile -> portal mutations -> rewrite ->
//! sign (deepest bundles first) -> repack.
//!
//! One control thread drives the phases; embarrassingly parallel work
//! (profile materialisation, Mach-O rewriting, per-level signing) fans
//! out over scoped threads bounded by the caller's width. Signing order
//! between depth levels is a hard barrier: a parent is never signed
//! until every descendant is done. Cancellation is checked at every
//! suspension point; the scratch directory dies with its guard, while
//! portal state created before the cancel persists by design and is
//! reused by the next run.

use {
    crate::{
        archive,
        bundle_inventory::{Bundle, BundleIndex, BundleInventory},
        capabilities::CapabilityMap,
        entitlement_reconciling::{
            reconcile, BundlePlan, ProfileEnvironment, ReconcileFlags, ReconcileInput,
        },
        error::{Result, WarpSignError},
        identifier_allocation::IdentifierAllocator,
        macho_rewriting::{MachImage, Replacement},
        plist_io,
        progress::{Phase, ProgressEvent, ProgressSink},
        signer::{CodeSigner, SignRequest},
        team_context::{PortalOps, TeamContext},
    },
    developer_portal::{Certificate, CertificateKind},
    log::{debug, info, warn},
    plist::{Dictionary, Value},
    std::{
        collections::BTreeMap,
        collections::BTreeSet,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
};

pub const DEFAULT_FAN_OUT: usize = 4;

/// Caller-facing options for one `sign` run.
#[derive(Clone, Debug)]
pub struct SignOptions {
    pub output: PathBuf,
    pub prefix: Option<String>,
    pub force_original_id: bool,
    pub patch_debug: bool,
    pub patch_file_sharing: bool,
    pub patch_promotion: bool,
    pub patch_all_devices: bool,
    pub remove_url_schemes: bool,
    pub bundle_name: Option<String>,
    pub icon: Option<PathBuf>,
    pub pin_icloud_containers: bool,
    pub keep_unknown_entitlements: bool,
    pub required_capabilities: BTreeSet<String>,
    pub fan_out: usize,
    /// Signing identity handed to the external signer.
    pub identity: String,
}

impl SignOptions {
    pub fn new(output: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            prefix: None,
            force_original_id: false,
            patch_debug: false,
            patch_file_sharing: false,
            patch_promotion: false,
            patch_all_devices: false,
            remove_url_schemes: false,
            bundle_name: None,
            icon: None,
            pin_icloud_containers: false,
            keep_unknown_entitlements: false,
            required_capabilities: BTreeSet::new(),
            fan_out: DEFAULT_FAN_OUT,
            identity: identity.into(),
        }
    }
}

/// Collaborators and run-wide context, owned by the caller.
pub struct SignRun<'a> {
    pub portal: &'a dyn PortalOps,
    pub signer: &'a dyn CodeSigner,
    pub sink: &'a dyn ProgressSink,
    pub cancel: Arc<AtomicBool>,
    pub team_id: String,
    pub certificate: Certificate,
    /// Optional `capabilities.toml` override file.
    pub capability_overrides: Option<PathBuf>,
}

/// What a completed run looked like.
#[derive(Debug)]
pub struct RunSummary {
    pub output: PathBuf,
    pub bundles_signed: usize,
    pub identifiers_touched: usize,
    pub warnings: Vec<String>,
}

pub fn run(run: &SignRun<'_>, ipa: &Path, options: &SignOptions) -> Result<RunSummary> {
    preflight(run, options)?;

    let environment = match run.certificate.kind {
        CertificateKind::Development => ProfileEnvironment::Development,
        CertificateKind::Distribution => ProfileEnvironment::Production,
    };

    // Scratch space lives exactly as long as this guard; cancellation and
    // errors both unwind through it.
    let scratch = tempfile::TempDir::new()?;

    run.check_cancelled()?;
    run.emit(Phase::Extract, 0, 1, ipa.display().to_string());
    let app_root = archive::extract_ipa(ipa, scratch.path())?;

    run.check_cancelled()?;
    run.emit(Phase::Inventory, 0, 1, "scanning bundles");
    let inventory = BundleInventory::scan(&app_root)?;
    let root_identifier = inventory.root().identifier.clone();

    let mut allocator = IdentifierAllocator::new(
        &run.team_id,
        &root_identifier,
        options.prefix.as_deref(),
        options.force_original_id,
        inventory.original_team_ids(),
    );

    // Portal access starts here; everything before is local-only.
    run.check_cancelled()?;
    run.emit(Phase::Authenticate, 0, 1, "portal login");
    run.portal.ensure_ready()?;

    let mut capability_map = CapabilityMap::builtin();
    if let Some(overrides) = &run.capability_overrides {
        capability_map.merge_overrides(overrides);
    }
    match run.portal.list_available_capabilities(&run.team_id) {
        Ok(available) => capability_map.merge_portal(&available, environment),
        Err(err) => warn!("capability listing unavailable ({err}); gating disabled"),
    }

    run.check_cancelled()?;
    let plans = build_plans(
        run,
        options,
        &inventory,
        &mut allocator,
        &capability_map,
        environment,
    )?;

    let mut warnings: Vec<String> = plans
        .values()
        .flat_map(|p| p.warnings.iter().cloned())
        .collect();

    run.check_cancelled()?;
    let mut team = TeamContext::bootstrap(
        run.portal,
        &run.team_id,
        run.certificate.clone(),
        environment,
    )?;

    let identifiers_touched = apply_portal_mutations(run, &inventory, &plans, &mut team)?;
    materialise_profiles(run, options, &inventory, &plans, &mut team)?;

    if run.portal.transient_retries() > 0 {
        run.emit(Phase::Portal, 1, 1, "retried");
    }

    run.check_cancelled()?;
    rewrite_bundles(run, options, &inventory, &plans, &team, &allocator, scratch.path())?;

    run.check_cancelled()?;
    let signed = sign_bundles(run, options, &inventory, &plans, scratch.path())?;

    run.check_cancelled()?;
    run.emit(Phase::Package, 0, 1, options.output.display().to_string());
    clean_app_bundle(&app_root)?;
    archive::pack_ipa(&app_root, &options.output)?;

    for warning in &warnings {
        warn!("{warning}");
    }
    warnings.sort();
    warnings.dedup();

    Ok(RunSummary {
        output: options.output.clone(),
        bundles_signed: signed,
        identifiers_touched,
        warnings,
    })
}

/// Flag contradictions are user errors and must fire before any portal
/// traffic.
fn preflight(run: &SignRun<'_>, options: &SignOptions) -> Result<()> {
    if options.force_original_id && run.certificate.kind == CertificateKind::Development {
        return Err(WarpSignError::ContradictoryFlags(
            "--force-original-id requires a distribution certificate".into(),
        ));
    }

    if options.patch_debug && run.certificate.kind == CertificateKind::Distribution {
        return Err(WarpSignError::ContradictoryFlags(
            "--patch-debug requires a development certificate".into(),
        ));
    }

    if let Some(icon) = &options.icon {
        if !icon.is_file() {
            return Err(WarpSignError::Config(format!(
                "icon file not found: {}",
                icon.display()
            )));
        }
    }

    Ok(())
}

/// Reconcile every primary bundle, parents before children so nested
/// identifiers can extend their parent's mapping.
fn build_plans(
    run: &SignRun<'_>,
    options: &SignOptions,
    inventory: &BundleInventory,
    allocator: &mut IdentifierAllocator,
    capability_map: &CapabilityMap,
    environment: ProfileEnvironment,
) -> Result<BTreeMap<BundleIndex, BundlePlan>> {
    let flags = ReconcileFlags {
        force_original_id: options.force_original_id,
        pin_icloud_containers: options.pin_icloud_containers,
        keep_unknown: options.keep_unknown_entitlements,
        required_capabilities: options.required_capabilities.clone(),
    };

    let primaries: Vec<BundleIndex> = inventory.primaries().collect();
    let mut plans = BTreeMap::new();

    for (position, index) in primaries.iter().enumerate() {
        let bundle = inventory.get(*index);
        run.emit(
            Phase::Reconcile,
            position + 1,
            primaries.len(),
            bundle.identifier.clone(),
        );

        let parent_plan = primary_ancestor(inventory, *index)
            .and_then(|ancestor| plans.get(&ancestor))
            .map(|p: &BundlePlan| (p.original_identifier.clone(), p.new_identifier.clone()));

        let plan = reconcile(
            ReconcileInput {
                declared: &bundle.entitlements,
                original_identifier: &bundle.identifier,
                display_name: &bundle.display_name,
                parent: parent_plan.as_ref().map(|(o, n)| (o.as_str(), n.as_str())),
                environment,
                flags: &flags,
                map: capability_map,
            },
            allocator,
        )?;

        debug!(
            "{} -> {} ({} capabilities)",
            plan.original_identifier,
            plan.new_identifier,
            plan.capabilities.len()
        );
        plans.insert(*index, plan);
    }

    Ok(plans)
}

fn primary_ancestor(inventory: &BundleInventory, index: BundleIndex) -> Option<BundleIndex> {
    let mut cursor = inventory.get(index).parent;
    while let Some(current) = cursor {
        if inventory.get(current).kind.is_primary() {
            return Some(current);
        }
        cursor = inventory.get(current).parent;
    }
    None
}

/// Apply the union of every plan's mutations, serialised; the team
/// context deduplicates across bundles.
fn apply_portal_mutations(
    run: &SignRun<'_>,
    inventory: &BundleInventory,
    plans: &BTreeMap<BundleIndex, BundlePlan>,
    team: &mut TeamContext,
) -> Result<usize> {
    let total: usize = plans.values().map(|p| p.mutations.len()).sum();
    let mut applied = 0usize;
    let mut step = 0usize;

    for (index, plan) in plans {
        let bundle = inventory.get(*index);
        for mutation in &plan.mutations {
            run.check_cancelled()?;
            step += 1;
            run.emit(
                Phase::Portal,
                step,
                total,
                format!("{} ({})", plan.new_identifier, bundle.relative_display()),
            );
            if team.apply_mutation(run.portal, mutation)? {
                applied += 1;
            }
        }
    }

    info!("portal: {applied} mutation(s) applied, {} already satisfied", total - applied);
    Ok(applied)
}

/// Fetch one provisioning profile per primary bundle, fanned out to the
/// configured width.
fn materialise_profiles(
    run: &SignRun<'_>,
    options: &SignOptions,
    _inventory: &BundleInventory,
    plans: &BTreeMap<BundleIndex, BundlePlan>,
    team: &mut TeamContext,
) -> Result<()> {
    // Distinct identifiers only: nested bundles can share a plan target.
    let mut wanted: Vec<String> = plans
        .values()
        .map(|p| p.new_identifier.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    wanted.retain(|id| team.profile_bytes(id).is_none());

    if wanted.is_empty() {
        return Ok(());
    }

    run.emit(
        Phase::Portal,
        0,
        wanted.len(),
        format!("materialising {} profile(s)", wanted.len()),
    );

    // ensure_profile needs &mut for its cache, so resolve resources
    // up front and fan the network calls out statelessly.
    let mut requests = Vec::new();
    for identifier in &wanted {
        let resource = team.identifier_resource(identifier).ok_or_else(|| {
            developer_portal::PortalError::ProfileCreationFailed(format!(
                "{identifier} was never registered"
            ))
        })?;
        requests.push((identifier.clone(), resource.to_string()));
    }

    let kind = match team.environment {
        ProfileEnvironment::Development => developer_portal::ProfileKind::Development,
        ProfileEnvironment::Production => developer_portal::ProfileKind::AdHoc,
    };
    let device_ids: Vec<String> = team
        .devices()
        .iter()
        .map(|d| d.resource_id.clone())
        .collect();
    let certificate_ids = vec![team.certificate.resource_id.clone()];
    let team_id = team.team_id.clone();

    let results = parallel_map(
        &requests,
        options.fan_out,
        &run.cancel,
        |(identifier, resource)| {
            let profile_name = format!("WS {identifier} {}", kind.label());
            let bytes = run.portal.create_profile(
                &team_id,
                resource,
                &profile_name,
                &certificate_ids,
                &device_ids,
                kind,
            )?;
            Ok((identifier.clone(), bytes))
        },
    )?;

    for (identifier, bytes) in results {
        team.store_profile(&identifier, bytes);
    }

    Ok(())
}

/// Rewrite plists and binaries, embed profiles, and write the resolved
/// entitlements files the signer will consume.
fn rewrite_bundles(
    run: &SignRun<'_>,
    options: &SignOptions,
    inventory: &BundleInventory,
    plans: &BTreeMap<BundleIndex, BundlePlan>,
    team: &TeamContext,
    allocator: &IdentifierAllocator,
    scratch: &Path,
) -> Result<()> {
    let entitlements_dir = scratch.join("entitlements");
    std::fs::create_dir_all(&entitlements_dir)?;

    let binary_patches = allocator.equal_length_replacements();
    let width = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_FAN_OUT);

    let indices: Vec<BundleIndex> = (0..inventory.bundles().len()).collect();
    let total = indices.len();
    let done = Mutex::new(0usize);

    parallel_map(&indices, width, &run.cancel, |&index| {
        let bundle = inventory.get(index);
        let plan = plans.get(&index);

        rewrite_one_bundle(
            options,
            inventory,
            bundle,
            plan,
            team,
            &binary_patches,
            &entitlements_dir,
            index == 0,
        )?;

        let mut done = done.lock().expect("progress mutex");
        *done += 1;
        run.emit(Phase::Rewrite, *done, total, bundle.relative_display());
        Ok(())
    })?;

    Ok(())
}

fn rewrite_one_bundle(
    options: &SignOptions,
    _inventory: &BundleInventory,
    bundle: &Bundle,
    plan: Option<&BundlePlan>,
    team: &TeamContext,
    binary_patches: &[Replacement],
    entitlements_dir: &Path,
    is_main_app: bool,
) -> Result<()> {
    // Auxiliary images only need their old signature gone and raw
    // identifier strings re-pointed.
    if let Some(plan) = plan {
        let info_path = bundle.root.join("Info.plist");
        if info_path.is_file() {
            patch_info_plist(&info_path, options, plan, is_main_app)?;
        }

        let profile = team.profile_bytes(&plan.new_identifier).ok_or_else(|| {
            developer_portal::PortalError::ProfileCreationFailed(format!(
                "no profile materialised for {}",
                plan.new_identifier
            ))
        })?;
        std::fs::write(bundle.root.join("embedded.mobileprovision"), profile)?;

        let entitlements_path =
            entitlements_dir.join(format!("{}.plist", plan.new_identifier.replace('/', "-")));
        plist_io::save_xml(
            &entitlements_path,
            &Value::Dictionary(plan.entitlements.clone()),
        )?;
    }

    if bundle.executable.is_file() {
        let mut image = MachImage::open(&bundle.executable)?;
        image.strip_code_signature()?;

        if let Some(plan) = plan {
            if !options.force_original_id {
                image.patch_embedded_info_plist(&[Replacement {
                    old: plan.original_identifier.clone(),
                    new: plan.new_identifier.clone(),
                }])?;
            }
        }

        if !binary_patches.is_empty() {
            image.patch_equal_length(binary_patches)?;
        }

        image.write()?;
    }

    Ok(())
}

fn patch_info_plist(
    info_path: &Path,
    options: &SignOptions,
    plan: &BundlePlan,
    is_main_app: bool,
) -> Result<()> {
    let mut info = plist_io::load_dictionary(info_path)?;

    if !options.force_original_id {
        info.insert(
            "CFBundleIdentifier".into(),
            Value::from(plan.new_identifier.as_str()),
        );
    }

    // Cosmetic and behavioural patches apply to the main app only; they
    // corrupt extensions.
    if is_main_app {
        if let Some(name) = &options.bundle_name {
            info.insert("CFBundleDisplayName".into(), Value::from(name.as_str()));
            info.insert("CFBundleName".into(), Value::from(name.as_str()));
        }

        if options.patch_file_sharing {
            info.insert("UIFileSharingEnabled".into(), Value::from(true));
            info.insert("UISupportsDocumentBrowser".into(), Value::from(true));
        }

        if options.patch_promotion {
            info.insert(
                "CADisableMinimumFrameDurationOnPhone".into(),
                Value::from(true),
            );
            info.insert("CAHighFrameRateDisplay".into(), Value::from(true));
        }

        if options.patch_all_devices {
            info.remove("UISupportedDevices");
            info.insert(
                "UIDeviceFamily".into(),
                Value::Array(vec![Value::from(1u64), Value::from(2u64)]),
            );
            info.insert("MinimumOSVersion".into(), Value::from("12.0"));
        }

        if options.remove_url_schemes {
            info.remove("CFBundleURLTypes");
        }

        if let Some(icon) = &options.icon {
            apply_icon(info_path.parent().expect("Info.plist has a parent"), icon, &mut info)?;
        }
    }

    plist_io::save_matching(info_path, &Value::Dictionary(info))?;
    Ok(())
}

/// Install replacement icon assets and point the icon dictionaries at
/// them. Bytes are copied as provided.
fn apply_icon(app_root: &Path, icon: &Path, info: &mut Dictionary) -> Result<()> {
    let bytes = std::fs::read(icon)?;

    let base = "wsicon";
    let iphone = format!("{base}60x60");
    let ipad = format!("{base}76x76");

    for name in [
        format!("{iphone}@2x.png"),
        format!("{iphone}@3x.png"),
        format!("{ipad}@2x~ipad.png"),
    ] {
        std::fs::write(app_root.join(name), &bytes)?;
    }

    let primary = |files: Vec<&str>| {
        let mut icon_dict = Dictionary::new();
        let mut primary = Dictionary::new();
        primary.insert(
            "CFBundleIconFiles".into(),
            Value::Array(files.into_iter().map(Value::from).collect()),
        );
        primary.insert("CFBundleIconName".into(), Value::from(base));
        icon_dict.insert("CFBundlePrimaryIcon".into(), Value::Dictionary(primary));
        Value::Dictionary(icon_dict)
    };

    info.insert("CFBundleIcons".into(), primary(vec![&iphone]));
    info.insert("CFBundleIcons~ipad".into(), primary(vec![&iphone, &ipad]));
    Ok(())
}

/// Deepest bundles first; parallel within a depth level, hard barrier
/// between levels.
fn sign_bundles(
    run: &SignRun<'_>,
    options: &SignOptions,
    inventory: &BundleInventory,
    plans: &BTreeMap<BundleIndex, BundlePlan>,
    scratch: &Path,
) -> Result<usize> {
    let order = inventory.signing_order();
    let total = order.len();

    let mut levels: BTreeMap<std::cmp::Reverse<usize>, Vec<BundleIndex>> = BTreeMap::new();
    for index in order {
        let depth = inventory.get(index).depth;
        levels.entry(std::cmp::Reverse(depth)).or_default().push(index);
    }

    let entitlements_dir = scratch.join("entitlements");
    let signed = Mutex::new(0usize);

    for (_, level) in levels {
        run.check_cancelled()?;

        parallel_map(&level, options.fan_out, &run.cancel, |&index| {
            let bundle = inventory.get(index);
            let entitlements = plans.get(&index).map(|plan| {
                entitlements_dir.join(format!("{}.plist", plan.new_identifier.replace('/', "-")))
            });

            run.signer.sign(&SignRequest {
                target: bundle.root.clone(),
                identity: options.identity.clone(),
                entitlements,
            })?;

            let mut signed = signed.lock().expect("progress mutex");
            *signed += 1;
            run.emit(Phase::Sign, *signed, total, bundle.relative_display());
            Ok(())
        })?;
    }

    Ok(signed.into_inner().expect("progress mutex"))
}

/// Leftovers that break installation: App Store DRM metadata and watch
/// placeholders.
fn clean_app_bundle(app_root: &Path) -> Result<()> {
    for name in ["SC_Info", "com.apple.WatchPlaceholder"] {
        let path = app_root.join(name);
        if path.is_dir() {
            warn!("removing {name} leftover from {}", app_root.display());
            std::fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}

/// Run `f` over `items` with at most `width` worker threads, stopping at
/// the first error. Results come back in input order.
fn parallel_map<T: Sync, R: Send>(
    items: &[T],
    width: usize,
    cancel: &Arc<AtomicBool>,
    f: impl Fn(&T) -> Result<R> + Sync,
) -> Result<Vec<R>> {
    let mut results = Vec::with_capacity(items.len());

    for chunk in items.chunks(width.max(1)) {
        if cancel.load(Ordering::Relaxed) {
            return Err(WarpSignError::Cancelled);
        }

        let chunk_results: Vec<Result<R>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk.iter().map(|item| scope.spawn(|| f(item))).collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(WarpSignError::BundleLayout("worker thread panicked".into()))
                    })
                })
                .collect()
        });

        for result in chunk_results {
            results.push(result?);
        }
    }

    Ok(results)
}

impl SignRun<'_> {
    fn emit(&self, phase: Phase, current: usize, total: usize, detail: impl Into<String>) {
        self.sink.event(&ProgressEvent {
            phase,
            current,
            total,
            detail: detail.into(),
        });
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(WarpSignError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_map_preserves_order_and_propagates_errors() {
        let cancel = Arc::new(AtomicBool::new(false));
        let items: Vec<usize> = (0..20).collect();

        let doubled = parallel_map(&items, 4, &cancel, |&n| Ok(n * 2)).unwrap();
        assert_eq!(doubled, (0..20).map(|n| n * 2).collect::<Vec<_>>());

        let failing = parallel_map(&items, 4, &cancel, |&n| {
            if n == 7 {
                Err(WarpSignError::Cancelled)
            } else {
                Ok(n)
            }
        });
        assert!(failing.is_err());
    }

    #[test]
    fn parallel_map_honours_cancellation() {
        let cancel = Arc::new(AtomicBool::new(true));
        let items = vec![1, 2, 3];
        let result = parallel_map(&items, 2, &cancel, |&n| Ok(n));
        assert!(matches!(result, Err(WarpSignError::Cancelled)));
    }
}
