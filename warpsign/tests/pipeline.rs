// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end pipeline scenarios against an in-memory portal and a
//! recording signer.

use {
    developer_portal::{
        AppGroup, AvailableCapability, BundleIdentifier, CapabilityRelationships, Certificate,
        CertificateKind, CloudContainer, Device, PortalError, ProfileKind,
    },
    plist::{Dictionary, Value},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
    tempfile::TempDir,
    warpsign::{
        archive,
        pipeline::{self, SignOptions, SignRun},
        progress::{Phase, RecordingSink},
        signer::{CodeSigner, SignRequest},
        team_context::PortalOps,
        WarpSignError,
    },
};

// ---------------------------------------------------------------------------
// Mach-O fixture builder: 64-bit LE image with an __info_plist section,
// a __LINKEDIT segment and a code signature blob carrying entitlements.
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn build_macho(info_plist: &[u8], section_size: usize, entitlements_xml: &[u8]) -> Vec<u8> {
    assert!(info_plist.len() <= section_size);

    const MH_MAGIC_64: u32 = 0xfeed_facf;
    const LC_SEGMENT_64: u32 = 0x19;
    const LC_CODE_SIGNATURE: u32 = 0x1d;
    const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

    let header_size = 32usize;
    let seg64_size = 72u32;
    let sect64_size = 80u32;
    let linkedit_data_size = 16u32;

    let text_cmd_size = seg64_size + sect64_size;
    let sizeofcmds = text_cmd_size + seg64_size + linkedit_data_size;

    let text_file_off = header_size + sizeofcmds as usize;
    let linkedit_off = text_file_off + section_size;
    let sig_size = entitlements_xml.len() + 8;
    let linkedit_size = 32 + sig_size;
    let sig_off = linkedit_off + 32;

    let total = linkedit_off + linkedit_size;
    let mut buf = vec![0u8; total];

    put_u32(&mut buf, 0, MH_MAGIC_64);
    put_u32(&mut buf, 4, 0x0100_000c); // arm64
    put_u32(&mut buf, 12, 2); // MH_EXECUTE
    put_u32(&mut buf, 16, 3); // ncmds
    put_u32(&mut buf, 20, sizeofcmds);

    // __TEXT + __info_plist
    let mut off = header_size;
    put_u32(&mut buf, off, LC_SEGMENT_64);
    put_u32(&mut buf, off + 4, text_cmd_size);
    buf[off + 8..off + 14].copy_from_slice(b"__TEXT");
    put_u64(&mut buf, off + 24, 0x1000);
    put_u64(&mut buf, off + 32, section_size as u64);
    put_u64(&mut buf, off + 40, text_file_off as u64);
    put_u64(&mut buf, off + 48, section_size as u64);
    put_u32(&mut buf, off + 64, 1); // nsects

    let sect = off + seg64_size as usize;
    buf[sect..sect + 12].copy_from_slice(b"__info_plist");
    buf[sect + 16..sect + 22].copy_from_slice(b"__TEXT");
    put_u64(&mut buf, sect + 32, 0x1000);
    put_u64(&mut buf, sect + 40, section_size as u64);
    put_u32(&mut buf, sect + 48, text_file_off as u32);

    // __LINKEDIT
    off = header_size + text_cmd_size as usize;
    put_u32(&mut buf, off, LC_SEGMENT_64);
    put_u32(&mut buf, off + 4, seg64_size);
    buf[off + 8..off + 18].copy_from_slice(b"__LINKEDIT");
    put_u64(&mut buf, off + 24, 0x2000);
    put_u64(&mut buf, off + 32, linkedit_size as u64);
    put_u64(&mut buf, off + 40, linkedit_off as u64);
    put_u64(&mut buf, off + 48, linkedit_size as u64);

    // LC_CODE_SIGNATURE
    off += seg64_size as usize;
    put_u32(&mut buf, off, LC_CODE_SIGNATURE);
    put_u32(&mut buf, off + 4, linkedit_data_size);
    put_u32(&mut buf, off + 8, sig_off as u32);
    put_u32(&mut buf, off + 12, sig_size as u32);

    buf[text_file_off..text_file_off + info_plist.len()].copy_from_slice(info_plist);

    buf[sig_off..sig_off + 4].copy_from_slice(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
    buf[sig_off + 4..sig_off + 8].copy_from_slice(&(sig_size as u32).to_be_bytes());
    buf[sig_off + 8..sig_off + 8 + entitlements_xml.len()].copy_from_slice(entitlements_xml);

    buf
}

fn embedded_info_plist(identifier: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\"?><plist version=\"1.0\"><dict>\
         <key>CFBundleIdentifier</key><string>{identifier}</string>\
         </dict></plist>"
    )
    .into_bytes()
}

fn entitlements_xml(entitlements: &Dictionary) -> Vec<u8> {
    let mut out = Vec::new();
    Value::Dictionary(entitlements.clone())
        .to_writer_xml(&mut out)
        .unwrap();
    out
}

// ---------------------------------------------------------------------------
// App fixture builder
// ---------------------------------------------------------------------------

struct FixtureBundle {
    relative: &'static str,
    identifier: &'static str,
    executable: &'static str,
    entitlements: Dictionary,
}

fn write_bundle(app_root: &Path, fixture: &FixtureBundle) {
    let root = if fixture.relative.is_empty() {
        app_root.to_path_buf()
    } else {
        app_root.join(fixture.relative)
    };
    std::fs::create_dir_all(&root).unwrap();

    let mut info = Dictionary::new();
    info.insert("CFBundleIdentifier".into(), Value::from(fixture.identifier));
    info.insert("CFBundleExecutable".into(), Value::from(fixture.executable));
    info.insert("CFBundleName".into(), Value::from(fixture.executable));
    let mut bytes = Vec::new();
    Value::Dictionary(info).to_writer_xml(&mut bytes).unwrap();
    std::fs::write(root.join("Info.plist"), bytes).unwrap();

    let binary = build_macho(
        &embedded_info_plist(fixture.identifier),
        512,
        &entitlements_xml(&fixture.entitlements),
    );
    std::fs::write(root.join(fixture.executable), binary).unwrap();
}

fn build_ipa(dir: &Path, bundles: &[FixtureBundle]) -> PathBuf {
    let staging = dir.join("staging");
    let app_root = staging.join("Demo.app");
    for fixture in bundles {
        write_bundle(&app_root, fixture);
    }

    let ipa = dir.join("Demo.ipa");
    archive::pack_ipa(&app_root, &ipa).unwrap();
    ipa
}

fn basic_entitlements(team: &str, identifier: &str) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(
        "application-identifier".into(),
        Value::from(format!("{team}.{identifier}")),
    );
    dict.insert("com.apple.developer.team-identifier".into(), Value::from(team));
    dict
}

// ---------------------------------------------------------------------------
// In-memory portal
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PortalState {
    identifiers: Vec<BundleIdentifier>,
    app_groups: Vec<AppGroup>,
    cloud_containers: Vec<CloudContainer>,
    capability_updates: Vec<(String, Vec<String>)>,
    register_calls: usize,
    profiles_created: Vec<String>,
}

struct FakePortal {
    state: Mutex<PortalState>,
    available: Vec<AvailableCapability>,
    simulated_retries: u32,
}

impl FakePortal {
    fn new() -> Self {
        Self {
            state: Mutex::new(PortalState::default()),
            available: vec![
                capability("PUSH_NOTIFICATIONS", &["aps-environment"]),
                capability("APP_GROUPS", &["com.apple.security.application-groups"]),
                capability("ICLOUD", &["com.apple.developer.icloud-container-identifiers"]),
            ],
            simulated_retries: 0,
        }
    }

    fn certificate(kind: CertificateKind) -> Certificate {
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
}

fn capability(id: &str, keys: &[&str]) -> AvailableCapability {
    AvailableCapability {
        id: id.into(),
        name: id.into(),
        optional: true,
        editable: true,
        profile_keys: keys.iter().map(|k| k.to_string()).collect(),
        distribution_types: vec!["Development".into(), "Ad hoc".into()],
        supports_ios: true,
    }
}

impl PortalOps for FakePortal {
    fn ensure_ready(&self) -> Result<(), PortalError> {
        Ok(())
    }

    fn list_identifiers(&self, _team: &str) -> Result<Vec<BundleIdentifier>, PortalError> {
        Ok(self.state.lock().unwrap().identifiers.clone())
    }

    fn register_identifier(
        &self,
        _team: &str,
        identifier: &str,
        name: &str,
    ) -> Result<BundleIdentifier, PortalError> {
        let mut state = self.state.lock().unwrap();
        state.register_calls += 1;
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
        _team: &str,
        _resource_id: &str,
        identifier: &str,
        capabilities: &[String],
        _relationships: &CapabilityRelationships,
    ) -> Result<(), PortalError> {
        self.state
            .lock()
            .unwrap()
            .capability_updates
            .push((identifier.to_string(), capabilities.to_vec()));
        Ok(())
    }

    fn list_app_groups(&self, _team: &str) -> Result<Vec<AppGroup>, PortalError> {
        Ok(self.state.lock().unwrap().app_groups.clone())
    }

    fn register_app_group(
        &self,
        _team: &str,
        identifier: &str,
        name: &str,
    ) -> Result<AppGroup, PortalError> {
        let mut state = self.state.lock().unwrap();
        let group = AppGroup {
            resource_id: format!("GRP-{}", state.app_groups.len() + 1),
            identifier: identifier.to_string(),
            name: name.to_string(),
        };
        state.app_groups.push(group.clone());
        Ok(group)
    }

    fn list_cloud_containers(&self, _team: &str) -> Result<Vec<CloudContainer>, PortalError> {
        Ok(self.state.lock().unwrap().cloud_containers.clone())
    }

    fn register_cloud_container(
        &self,
        _team: &str,
        identifier: &str,
        name: &str,
    ) -> Result<CloudContainer, PortalError> {
        let mut state = self.state.lock().unwrap();
        let container = CloudContainer {
            resource_id: format!("CTR-{}", state.cloud_containers.len() + 1),
            identifier: identifier.to_string(),
            name: name.to_string(),
        };
        state.cloud_containers.push(container.clone());
        Ok(container)
    }

    fn list_devices(&self, _team: &str) -> Result<Vec<Device>, PortalError> {
        Ok(vec![Device {
            resource_id: "DEV1".into(),
            name: "Test iPhone".into(),
            udid: "udid-1".into(),
            device_class: "IPHONE".into(),
            platform: "IOS".into(),
            model: None,
        }])
    }

    fn list_certificates(&self, _team: &str) -> Result<Vec<Certificate>, PortalError> {
        Ok(vec![Self::certificate(CertificateKind::Development)])
    }

    fn list_available_capabilities(
        &self,
        _team: &str,
    ) -> Result<Vec<AvailableCapability>, PortalError> {
        Ok(self.available.clone())
    }

    fn create_profile(
        &self,
        _team: &str,
        _app_id_resource: &str,
        profile_name: &str,
        _certificate_ids: &[String],
        _device_ids: &[String],
        _kind: ProfileKind,
    ) -> Result<Vec<u8>, PortalError> {
        self.state
            .lock()
            .unwrap()
            .profiles_created
            .push(profile_name.to_string());
        Ok(format!("mobileprovision:{profile_name}").into_bytes())
    }

    fn transient_retries(&self) -> u32 {
        self.simulated_retries
    }
}

/// Signer that records requests and captures each entitlements file
/// before the scratch directory disappears.
#[derive(Default)]
struct CapturingSigner {
    invocations: Mutex<Vec<(PathBuf, Option<Dictionary>)>>,
    cancel_after_first: Option<Arc<AtomicBool>>,
}

impl CodeSigner for CapturingSigner {
    fn sign(&self, request: &SignRequest) -> Result<(), WarpSignError> {
        let entitlements = request
            .entitlements
            .as_ref()
            .and_then(|path| std::fs::read(path).ok())
            .and_then(|bytes| plist::Value::from_reader(std::io::Cursor::new(bytes)).ok())
            .and_then(|value| match value {
                Value::Dictionary(dict) => Some(dict),
                _ => None,
            });

        self.invocations
            .lock()
            .unwrap()
            .push((request.target.clone(), entitlements));

        if let Some(cancel) = &self.cancel_after_first {
            cancel.store(true, Ordering::SeqCst);
        }

        Ok(())
    }
}

impl CapturingSigner {
    fn targets(&self) -> Vec<PathBuf> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn entitlements_by_target(&self) -> BTreeMap<String, Dictionary> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(target, ents)| {
                ents.clone().map(|e| {
                    (
                        target
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default(),
                        e,
                    )
                })
            })
            .collect()
    }
}

fn run_pipeline(
    portal: &FakePortal,
    signer: &CapturingSigner,
    sink: &RecordingSink,
    kind: CertificateKind,
    ipa: &Path,
    output: &Path,
    tweak: impl FnOnce(&mut SignOptions),
) -> Result<pipeline::RunSummary, WarpSignError> {
    let mut options = SignOptions::new(output, "test identity");
    options.prefix = Some("wsfixed0001".into());
    tweak(&mut options);

    let run = SignRun {
        portal,
        signer,
        sink,
        cancel: Arc::new(AtomicBool::new(false)),
        team_id: "TEAM123456".into(),
        certificate: FakePortal::certificate(kind),
        capability_overrides: None,
    };

    pipeline::run(&run, ipa, &options)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn single_binary_development_defaults() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.hello",
            executable: "Demo",
            entitlements: Dictionary::new(),
        }],
    );

    let portal = FakePortal::new();
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();
    let output = dir.path().join("out.ipa");

    let summary = run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Development,
        &ipa,
        &output,
        |_| {},
    )
    .unwrap();

    assert_eq!(summary.bundles_signed, 1);
    assert!(output.is_file());

    // One identifier, one profile, one signer invocation.
    let state = portal.state.lock().unwrap();
    assert_eq!(state.identifiers.len(), 1);
    assert_eq!(state.identifiers[0].identifier, "wsfixed0001.com-example-hello");
    assert_eq!(state.profiles_created.len(), 1);
    drop(state);
    assert_eq!(signer.targets().len(), 1);

    // Derived entitlement set.
    let entitlements = signer.entitlements_by_target();
    let app_ents = entitlements.get("Demo.app").expect("app entitlements");
    assert_eq!(
        app_ents.get("application-identifier").and_then(|v| v.as_string()),
        Some("TEAM123456.wsfixed0001.com-example-hello")
    );
    assert_eq!(
        app_ents
            .get("com.apple.developer.team-identifier")
            .and_then(|v| v.as_string()),
        Some("TEAM123456")
    );
    assert_eq!(app_ents.get("get-task-allow"), Some(&Value::Boolean(true)));
    let Some(Value::Array(keychain)) = app_ents.get("keychain-access-groups") else {
        panic!("keychain groups missing");
    };
    assert_eq!(keychain[0].as_string(), Some("TEAM123456.*"));

    // The produced archive carries the new identifier and a profile.
    let extracted = TempDir::new().unwrap();
    let app = archive::extract_ipa(&output, extracted.path()).unwrap();
    assert!(app.join("embedded.mobileprovision").is_file());

    let info = std::fs::read(app.join("Info.plist")).unwrap();
    let Value::Dictionary(info) =
        plist::Value::from_reader(std::io::Cursor::new(info)).unwrap()
    else {
        panic!("Info.plist is not a dict");
    };
    assert_eq!(
        info.get("CFBundleIdentifier").and_then(|v| v.as_string()),
        Some("wsfixed0001.com-example-hello")
    );

    // The rewritten binary reports the new identifier too.
    let binary = std::fs::read(app.join("Demo")).unwrap();
    let needle = b"wsfixed0001.com-example-hello";
    assert!(binary
        .windows(needle.len())
        .any(|window| window == needle));
}

#[test]
fn app_and_extension_distribution_push() {
    let dir = TempDir::new().unwrap();

    let mut app_ents = basic_entitlements("OLDTEAM123", "com.acme.app");
    app_ents.insert("aps-environment".into(), Value::from("development"));
    let mut ext_ents = basic_entitlements("OLDTEAM123", "com.acme.app.share");
    ext_ents.insert("aps-environment".into(), Value::from("development"));

    let ipa = build_ipa(
        dir.path(),
        &[
            FixtureBundle {
                relative: "",
                identifier: "com.acme.app",
                executable: "Demo",
                entitlements: app_ents,
            },
            FixtureBundle {
                relative: "PlugIns/Share.appex",
                identifier: "com.acme.app.share",
                executable: "Share",
                entitlements: ext_ents,
            },
        ],
    );

    let portal = FakePortal::new();
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();
    let output = dir.path().join("out.ipa");

    run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Distribution,
        &ipa,
        &output,
        |_| {},
    )
    .unwrap();

    // Two identifiers, both with push enabled.
    let state = portal.state.lock().unwrap();
    assert_eq!(state.identifiers.len(), 2);
    assert_eq!(state.capability_updates.len(), 2);
    for (_, capabilities) in &state.capability_updates {
        assert!(capabilities.contains(&"PUSH_NOTIFICATIONS".to_string()));
    }
    drop(state);

    // aps-environment production everywhere; tree invariant holds.
    let entitlements = signer.entitlements_by_target();
    let app = entitlements.get("Demo.app").unwrap();
    let ext = entitlements.get("Share.appex").unwrap();
    assert_eq!(
        app.get("aps-environment").and_then(|v| v.as_string()),
        Some("production")
    );
    assert_eq!(
        ext.get("aps-environment").and_then(|v| v.as_string()),
        Some("production")
    );
    assert!(app.get("get-task-allow").is_none());

    let app_id = app
        .get("application-identifier")
        .and_then(|v| v.as_string())
        .unwrap();
    let ext_id = ext
        .get("application-identifier")
        .and_then(|v| v.as_string())
        .unwrap();
    assert!(
        ext_id.starts_with(&format!("{app_id}.")),
        "{ext_id} must extend {app_id}"
    );

    // Parent signed after child.
    let targets = signer.targets();
    assert_eq!(targets.len(), 2);
    assert!(targets[0].ends_with("Share.appex"));
    assert!(targets[1].ends_with("Demo.app"));
}

#[test]
fn force_original_id_with_development_cert_fails_before_portal() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.hello",
            executable: "Demo",
            entitlements: Dictionary::new(),
        }],
    );

    let portal = FakePortal::new();
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();

    let err = run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Development,
        &ipa,
        &dir.path().join("out.ipa"),
        |options| options.force_original_id = true,
    )
    .unwrap_err();

    assert!(matches!(err, WarpSignError::ContradictoryFlags(_)));
    assert_eq!(err.exit_code(), 1);

    // Nothing reached the portal.
    let state = portal.state.lock().unwrap();
    assert_eq!(state.register_calls, 0);
    assert!(state.identifiers.is_empty());
}

#[test]
fn unavailable_capability_is_stripped_with_warning() {
    let dir = TempDir::new().unwrap();

    let mut ents = Dictionary::new();
    ents.insert("com.apple.developer.healthkit".into(), Value::from(true));

    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.health",
            executable: "Demo",
            entitlements: ents,
        }],
    );

    // The fake portal's capability listing has no HEALTHKIT.
    let portal = FakePortal::new();
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();
    let output = dir.path().join("out.ipa");

    let summary = run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Development,
        &ipa,
        &output,
        |_| {},
    )
    .unwrap();

    assert!(output.is_file(), "signing must still succeed");
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.contains("healthkit") || w.contains("HEALTHKIT")));

    let entitlements = signer.entitlements_by_target();
    let app = entitlements.get("Demo.app").unwrap();
    assert!(app.get("com.apple.developer.healthkit").is_none());
}

#[test]
fn transient_retries_surface_as_one_event() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.hello",
            executable: "Demo",
            entitlements: Dictionary::new(),
        }],
    );

    let mut portal = FakePortal::new();
    portal.simulated_retries = 2;
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();

    run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Development,
        &ipa,
        &dir.path().join("out.ipa"),
        |_| {},
    )
    .unwrap();

    let retried: Vec<String> = sink
        .details_for(Phase::Portal)
        .into_iter()
        .filter(|d| d == "retried")
        .collect();
    assert_eq!(retried.len(), 1, "exactly one retried event");
}

#[test]
fn cancellation_mid_signing_exits_with_code_four() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[
            FixtureBundle {
                relative: "",
                identifier: "com.acme.app",
                executable: "Demo",
                entitlements: Dictionary::new(),
            },
            FixtureBundle {
                relative: "PlugIns/Share.appex",
                identifier: "com.acme.app.share",
                executable: "Share",
                entitlements: Dictionary::new(),
            },
        ],
    );

    let portal = FakePortal::new();
    let sink = RecordingSink::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let signer = CapturingSigner {
        invocations: Mutex::new(Vec::new()),
        cancel_after_first: Some(cancel.clone()),
    };

    let mut options = SignOptions::new(dir.path().join("out.ipa"), "test identity");
    options.prefix = Some("wsfixed0001".into());

    let run = SignRun {
        portal: &portal,
        signer: &signer,
        sink: &sink,
        cancel,
        team_id: "TEAM123456".into(),
        certificate: FakePortal::certificate(CertificateKind::Development),
        capability_overrides: None,
    };

    let err = pipeline::run(&run, &ipa, &options).unwrap_err();
    assert!(matches!(err, WarpSignError::Cancelled));
    assert_eq!(err.exit_code(), 4);

    // Portal state created before the cancel persists.
    let state = portal.state.lock().unwrap();
    assert_eq!(state.identifiers.len(), 2);

    // The deepest bundle was signed; the parent never was.
    let targets = signer.targets();
    assert!(targets.iter().all(|t| !t.ends_with("Demo.app")));
}

#[test]
fn rerunning_reuses_portal_state_and_reproduces_entitlements() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.hello",
            executable: "Demo",
            entitlements: Dictionary::new(),
        }],
    );

    let portal = FakePortal::new();
    let sink = RecordingSink::new();

    let signer_one = CapturingSigner::default();
    run_pipeline(
        &portal,
        &signer_one,
        &sink,
        CertificateKind::Development,
        &ipa,
        &dir.path().join("out1.ipa"),
        |_| {},
    )
    .unwrap();

    let registers_after_first = portal.state.lock().unwrap().register_calls;

    let signer_two = CapturingSigner::default();
    run_pipeline(
        &portal,
        &signer_two,
        &sink,
        CertificateKind::Development,
        &ipa,
        &dir.path().join("out2.ipa"),
        |_| {},
    )
    .unwrap();

    let state = portal.state.lock().unwrap();
    assert_eq!(
        state.register_calls, registers_after_first,
        "second run must not register anything new"
    );
    assert_eq!(state.identifiers.len(), 1);
    drop(state);

    // Identical resolved entitlements across runs.
    assert_eq!(
        signer_one.entitlements_by_target(),
        signer_two.entitlements_by_target()
    );
}

#[test]
fn identifier_over_the_limit_fails_before_any_portal_mutation() {
    let dir = TempDir::new().unwrap();
    let ipa = build_ipa(
        dir.path(),
        &[FixtureBundle {
            relative: "",
            identifier: "com.example.hello",
            executable: "Demo",
            entitlements: Dictionary::new(),
        }],
    );

    let portal = FakePortal::new();
    let signer = CapturingSigner::default();
    let sink = RecordingSink::new();

    let err = run_pipeline(
        &portal,
        &signer,
        &sink,
        CertificateKind::Development,
        &ipa,
        &dir.path().join("out.ipa"),
        |options| options.prefix = Some("p".repeat(250)),
    )
    .unwrap_err();

    assert!(matches!(err, WarpSignError::IdentifierTooLong { .. }));
    assert_eq!(portal.state.lock().unwrap().register_calls, 0);
}
