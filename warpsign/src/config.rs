// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tool configuration.
//!
//! Sources, weakest first: `<home>/config.toml`, `WARPSIGN_`-prefixed
//! environment variables, then the `APPLE_ID`/`APPLE_PASSWORD` overrides.
//! `<home>` is `~/.warpsign`, or `WARPSIGN_HOME` when set. The same
//! directory holds sessions and certificates, all owner-only.

use {
    crate::error::{Result, WarpSignError},
    developer_portal::CertificateKind,
    figment::{
        providers::{Env, Format, Toml},
        Figment,
    },
    log::debug,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

pub const CONFIG_FILE: &str = "config.toml";
pub const CAPABILITY_OVERRIDES_FILE: &str = "capabilities.toml";

/// `config.toml` schema. Everything optional; required keys are checked
/// per subcommand.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WarpSignConfig {
    pub apple_id: Option<String>,
    /// Only ever honoured from the environment; never written to disk.
    #[serde(skip_serializing)]
    pub apple_password: Option<String>,
    pub team_id: Option<String>,
    pub prefix: Option<String>,
    /// External signer executable; defaults to `codesign` on PATH.
    pub signer: Option<String>,
    // CI hand-off settings.
    pub github_token: Option<String>,
    pub repository: Option<String>,
    pub workflow: Option<String>,
}

/// The base directory, `WARPSIGN_HOME` or `~/.warpsign`.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("WARPSIGN_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".warpsign"))
        .ok_or_else(|| WarpSignError::Config("cannot locate a home directory".into()))
}

/// Load configuration from `home`, applying environment overrides.
pub fn load(home: &Path) -> Result<WarpSignConfig> {
    let config_path = home.join(CONFIG_FILE);
    debug!("loading configuration from {}", config_path.display());

    let mut config: WarpSignConfig = Figment::new()
        .merge(Toml::file(&config_path))
        .merge(Env::prefixed("WARPSIGN_"))
        .extract()
        .map_err(|err| WarpSignError::Config(format!("{err}")))?;

    if let Ok(apple_id) = std::env::var("APPLE_ID") {
        if !apple_id.is_empty() {
            config.apple_id = Some(apple_id);
        }
    }
    if let Ok(password) = std::env::var("APPLE_PASSWORD") {
        if !password.is_empty() {
            config.apple_password = Some(password);
        }
    }

    Ok(config)
}

/// Whether any configuration exists at all. Used to steer users to
/// `setup` instead of failing on individual keys.
pub fn exists(home: &Path) -> bool {
    home.join(CONFIG_FILE).is_file()
}

pub fn capability_overrides_path(home: &Path) -> PathBuf {
    home.join(CAPABILITY_OVERRIDES_FILE)
}

/// `certificates/{development,distribution}/cert.p12` and the matching
/// password file.
pub fn certificate_paths(home: &Path, kind: CertificateKind) -> (PathBuf, PathBuf) {
    let dir = home.join("certificates").join(match kind {
        CertificateKind::Development => "development",
        CertificateKind::Distribution => "distribution",
    });
    (dir.join("cert.p12"), dir.join("cert_pass.txt"))
}

/// Create the on-disk layout with owner-only permissions.
pub fn ensure_layout(home: &Path) -> Result<()> {
    for dir in [
        home.to_path_buf(),
        home.join("sessions"),
        home.join("certificates/development"),
        home.join("certificates/distribution"),
    ] {
        std::fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_toml_values() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join(CONFIG_FILE),
            "apple_id = \"dev@example.com\"\nprefix = \"ws42\"\nrepository = \"acme/signing\"\n",
        )
        .unwrap();

        let config = load(home.path()).unwrap();
        assert_eq!(config.apple_id.as_deref(), Some("dev@example.com"));
        assert_eq!(config.prefix.as_deref(), Some("ws42"));
        assert_eq!(config.repository.as_deref(), Some("acme/signing"));
        assert!(config.github_token.is_none());
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let home = TempDir::new().unwrap();
        let config = load(home.path()).unwrap();
        assert!(config.apple_id.is_none());
        assert!(!exists(home.path()));
    }

    #[test]
    fn layout_creates_owner_only_directories() {
        let home = TempDir::new().unwrap();
        ensure_layout(home.path()).unwrap();

        assert!(home.path().join("sessions").is_dir());
        assert!(home.path().join("certificates/development").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(home.path().join("sessions"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn certificate_paths_follow_kind() {
        let (p12, pass) = certificate_paths(Path::new("/base"), CertificateKind::Distribution);
        assert_eq!(p12, PathBuf::from("/base/certificates/distribution/cert.p12"));
        assert_eq!(
            pass,
            PathBuf::from("/base/certificates/distribution/cert_pass.txt")
        );
    }
}
