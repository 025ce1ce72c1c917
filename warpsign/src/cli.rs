// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line interface.

use {
    crate::{
        ci,
        config::{self, WarpSignConfig},
        error::{Result, WarpSignError},
        pipeline::{self, SignOptions, SignRun, DEFAULT_FAN_OUT},
        progress::LogSink,
        signer::{resolve_signer_program, CommandSigner},
    },
    clap::{ArgAction, Args, Parser, Subcommand},
    developer_portal::{
        Certificate, CertificateKind, DeveloperPortalClient, PortalCredentials, PortalError,
        TwoFactorMode, TwoFactorPrompt,
    },
    log::{info, warn, LevelFilter},
    sha2::Digest,
    std::{
        collections::BTreeSet,
        io::Write,
        path::PathBuf,
        sync::{atomic::AtomicBool, Arc},
    },
};

#[derive(Parser)]
#[command(name = "warpsign", version, about = "Re-sign iOS app archives against your own developer team")]
pub struct Cli {
    /// Increase logging verbosity (repeat for more).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign an IPA locally through the Developer Portal.
    Sign(SignArgs),
    /// Hand a signing request off to the configured CI system.
    SignCi(SignArgs),
    /// Interactive configuration wizard.
    Setup {
        /// Also configure the CI hand-off keys.
        #[arg(long)]
        ci: bool,
    },
}

#[derive(Args)]
struct SignArgs {
    /// The archive to sign.
    ipa: PathBuf,

    /// Output path (default: `<input>-signed.ipa`).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Which certificate to sign with.
    #[arg(long, value_enum, default_value = "development")]
    cert_type: CertTypeArg,

    /// Explicit team id when the Apple ID belongs to several teams.
    #[arg(long)]
    team_id: Option<String>,

    /// Keep the original bundle identifier (requires a distribution
    /// certificate; may fix push for apps that hard-code their id).
    #[arg(long)]
    force_original_id: bool,

    /// Set get-task-allow for debugging (requires a development
    /// certificate).
    #[arg(long)]
    patch_debug: bool,

    /// Force UIFileSharingEnabled in Info.plist.
    #[arg(long)]
    patch_file_sharing: bool,

    /// Force the ProMotion/120Hz opt-in keys.
    #[arg(long)]
    patch_promotion: bool,

    /// Enable all device families and lower the minimum OS version.
    #[arg(long)]
    patch_all_devices: bool,

    /// Remove CFBundleURLTypes registration.
    #[arg(long)]
    remove_url_schemes: bool,

    /// Replace the visible app name.
    #[arg(long)]
    bundle_name: Option<String>,

    /// Replace the primary app icon with this image.
    #[arg(long)]
    icon: Option<PathBuf>,

    /// Identifier prefix (default: a deterministic hash of the original
    /// root identifier and the team id).
    #[arg(long)]
    prefix: Option<String>,

    /// Allocate brand-new identifiers instead of reusing matching ones
    /// from earlier runs.
    #[arg(long)]
    fresh_identifiers: bool,

    /// Keep iCloud container identifiers as declared instead of
    /// re-deriving them from the new bundle identifier.
    #[arg(long)]
    pin_icloud_containers: bool,

    /// Pass entitlements this tool does not recognise through instead of
    /// stripping them.
    #[arg(long)]
    keep_unknown_entitlements: bool,

    /// Fail instead of stripping when this capability is unavailable
    /// (repeatable; portal capability id, e.g. HEALTHKIT).
    #[arg(long = "require-capability")]
    require_capability: Vec<String>,

    /// Concurrent portal/signer operations.
    #[arg(long, default_value_t = DEFAULT_FAN_OUT)]
    fan_out: usize,

    /// External signer executable.
    #[arg(long)]
    signer: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CertTypeArg {
    Development,
    Distribution,
}

impl From<CertTypeArg> for CertificateKind {
    fn from(arg: CertTypeArg) -> Self {
        match arg {
            CertTypeArg::Development => CertificateKind::Development,
            CertTypeArg::Distribution => CertificateKind::Distribution,
        }
    }
}

/// Interactive second-factor acquisition on the controlling terminal.
struct StdinPrompt;

impl TwoFactorPrompt for StdinPrompt {
    fn prompt(
        &self,
        mode: TwoFactorMode,
        hint: Option<&str>,
    ) -> std::result::Result<String, PortalError> {
        match (mode, hint) {
            (TwoFactorMode::Sms, Some(hint)) => {
                eprint!("Enter the code sent to {hint}: ")
            }
            (TwoFactorMode::Sms, None) => eprint!("Enter the SMS verification code: "),
            _ => eprint!("Enter the verification code from your trusted device: "),
        }
        std::io::stderr().flush().ok();

        let mut code = String::new();
        std::io::stdin().read_line(&mut code)?;
        Ok(code.trim().to_string())
    }
}

pub fn main_impl() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Sign(args) => run_sign(args),
        Command::SignCi(args) => run_sign_ci(args),
        Command::Setup { ci } => run_setup(ci),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()));

    if level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();
}

fn run_sign(args: SignArgs) -> Result<()> {
    let home = config::home_dir()?;
    config::ensure_layout(&home)?;
    let cfg = load_config_for_sign(&home)?;

    let apple_id = cfg
        .apple_id
        .clone()
        .ok_or(WarpSignError::SetupRequired)?;

    if !args.ipa.is_file() {
        return Err(WarpSignError::ArchiveUnreadable(args.ipa.clone()));
    }

    let wanted_kind: CertificateKind = args.cert_type.into();

    let signer_program = args
        .signer
        .clone()
        .or_else(|| cfg.signer.clone().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("codesign"));
    let signer = CommandSigner::new(resolve_signer_program(&signer_program)?);

    let portal = DeveloperPortalClient::new(
        &home,
        PortalCredentials {
            apple_id,
            password: cfg.apple_password.clone(),
            prompt: Box::new(StdinPrompt),
        },
    )?;

    let team = portal.resolve_team(args.team_id.as_deref().or(cfg.team_id.as_deref()))?;
    let certificate = pick_certificate(&portal, &team.team_id, wanted_kind)?;
    info!(
        "signing with {} ({}) on team {}",
        certificate.name, certificate.serial_number, team.team_id
    );

    let options = build_options(&args, &cfg, &certificate)?;

    let sink = LogSink;
    let run = SignRun {
        portal: &portal,
        signer: &signer,
        sink: &sink,
        cancel: Arc::new(AtomicBool::new(false)),
        team_id: team.team_id.clone(),
        certificate,
        capability_overrides: Some(config::capability_overrides_path(&home)),
    };

    let summary = pipeline::run(&run, &args.ipa, &options)?;

    println!("Signed: {}", summary.output.display());
    println!(
        "{} bundle(s) signed, {} portal mutation(s) applied",
        summary.bundles_signed, summary.identifiers_touched
    );
    if !summary.warnings.is_empty() {
        println!("Warnings:");
        for warning in &summary.warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}

fn run_sign_ci(args: SignArgs) -> Result<()> {
    let home = config::home_dir()?;
    let cfg = load_config_for_sign(&home)?;

    // The options travel to the runner; certificate resolution happens
    // remotely, so a placeholder identity is fine here.
    let options = build_options_without_certificate(&args, &cfg)?;
    let request = ci::build_request(args.ipa.clone(), &cfg, options)?;

    warn!(
        "CI hand-off prepared for {} via {}/{}",
        request.ipa.display(),
        request.repository,
        request.workflow
    );

    // The dispatching collaborator is an external component; this build
    // only validates and packages the request.
    Err(WarpSignError::Config(
        "no CI runner is linked into this build; run `warpsign sign` locally instead".into(),
    ))
}

fn run_setup(_ci: bool) -> Result<()> {
    let home = config::home_dir()?;
    eprintln!("The interactive wizard is provided by a separate component.");
    eprintln!(
        "Create {} with at least:\n\n  apple_id = \"you@example.com\"\n",
        home.join(config::CONFIG_FILE).display()
    );
    eprintln!(
        "and place certificates under {}/certificates/{{development,distribution}}/cert.p12",
        home.display()
    );
    Err(WarpSignError::SetupRequired)
}

fn load_config_for_sign(home: &std::path::Path) -> Result<WarpSignConfig> {
    let cfg = config::load(home)?;

    // No config file and nothing from the environment means the user has
    // never run setup.
    if cfg.apple_id.is_none() && !config::exists(home) {
        return Err(WarpSignError::SetupRequired);
    }

    Ok(cfg)
}

fn pick_certificate(
    portal: &DeveloperPortalClient,
    team_id: &str,
    kind: CertificateKind,
) -> Result<Certificate> {
    let mut certificates = portal.list_certificates(team_id)?;
    certificates.retain(|c| c.kind == kind);

    certificates.into_iter().next().ok_or_else(|| {
        WarpSignError::Config(format!(
            "team {team_id} has no {kind:?} signing certificate"
        ))
    })
}

fn build_options(
    args: &SignArgs,
    cfg: &WarpSignConfig,
    certificate: &Certificate,
) -> Result<SignOptions> {
    let mut options = build_options_without_certificate(args, cfg)?;
    options.identity = certificate.name.clone();
    Ok(options)
}

fn build_options_without_certificate(
    args: &SignArgs,
    cfg: &WarpSignConfig,
) -> Result<SignOptions> {
    let output = args.output.clone().unwrap_or_else(|| {
        let stem = args
            .ipa
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".to_string());
        args.ipa.with_file_name(format!("{stem}-signed.ipa"))
    });

    let prefix = args
        .prefix
        .clone()
        .or_else(|| cfg.prefix.clone())
        .or_else(|| args.fresh_identifiers.then(fresh_prefix));

    let mut options = SignOptions::new(output, String::new());
    options.prefix = prefix;
    options.force_original_id = args.force_original_id;
    options.patch_debug = args.patch_debug;
    options.patch_file_sharing = args.patch_file_sharing;
    options.patch_promotion = args.patch_promotion;
    options.patch_all_devices = args.patch_all_devices;
    options.remove_url_schemes = args.remove_url_schemes;
    options.bundle_name = args.bundle_name.clone();
    options.icon = args.icon.clone();
    options.pin_icloud_containers = args.pin_icloud_containers;
    options.keep_unknown_entitlements = args.keep_unknown_entitlements;
    options.required_capabilities = args
        .require_capability
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>();
    options.fan_out = args.fan_out.max(1);

    Ok(options)
}

/// A per-run prefix for `--fresh-identifiers`: salting the prefix with
/// the current time makes every identifier brand new, so nothing from a
/// previous run is reused or updated.
fn fresh_prefix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = sha2::Sha256::digest(nanos.to_be_bytes());
    format!("ws{}", &hex::encode(digest)[..10])
}
