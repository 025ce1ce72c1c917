// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk persistence for authenticated portal sessions.
//!
//! One JSON file per Apple ID under `<base>/sessions/`, holding the cookie
//! set and the `X-Apple-ID-Session-Id`/`scnt` pair handed out after a
//! successful two-factor dance. A fresh session file means the next run
//! skips the SRP exchange entirely.
//!
//! The file is rewritten atomically (temp file + rename) after every
//! response that mutates cookies, and an advisory lock file keeps two
//! concurrent invocations from interleaving writes.

use {
    crate::PortalError,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        io::Write,
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Serialised session state. Schema is stable across releases; unknown
/// fields from future versions are ignored on load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub apple_id: String,
    pub client_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scnt: Option<String>,
    #[serde(default)]
    pub widget_key: Option<String>,
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
}

/// Handle on the per-Apple-ID session file.
///
/// All mutation happens behind a mutex; every mutation is flushed to disk
/// before the lock is released.
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
    data: Mutex<SessionData>,
}

impl SessionStore {
    /// Open (or create) the session for `apple_id` under `base_dir`.
    ///
    /// `base_dir` is the tool home (e.g. `~/.warpsign`); the store manages
    /// the `sessions/` directory beneath it.
    pub fn open(base_dir: &Path, apple_id: &str) -> Result<Self, PortalError> {
        let sessions_dir = base_dir.join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        restrict_dir(&sessions_dir)?;

        let file_stem = sanitize_apple_id(apple_id);
        let path = sessions_dir.join(format!("{file_stem}.session"));
        let lock_path = sessions_dir.join(format!("{file_stem}.session.lock"));

        acquire_lock(&lock_path)?;

        let data = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<SessionData>(&bytes) {
                Ok(data) => {
                    debug!("loaded session for {apple_id} from {}", path.display());
                    data
                }
                Err(err) => {
                    warn!("session file {} is corrupt ({err}); starting fresh", path.display());
                    SessionData::fresh(apple_id)
                }
            },
            Err(_) => SessionData::fresh(apple_id),
        };

        Ok(Self {
            path,
            lock_path,
            data: Mutex::new(data),
        })
    }

    /// Whether a previously trusted session is on file.
    pub fn has_trusted_session(&self) -> bool {
        let data = self.data.lock().expect("session mutex");
        data.session_id.is_some() && data.scnt.is_some()
    }

    pub fn snapshot(&self) -> SessionData {
        self.data.lock().expect("session mutex").clone()
    }

    /// Record the post-2FA session identifiers and persist.
    pub fn store_trusted(
        &self,
        session_id: String,
        scnt: String,
    ) -> Result<(), PortalError> {
        let mut data = self.data.lock().expect("session mutex");
        data.session_id = Some(session_id);
        data.scnt = Some(scnt);
        self.persist(&data)
    }

    pub fn store_widget_key(&self, key: String) -> Result<(), PortalError> {
        let mut data = self.data.lock().expect("session mutex");
        if data.widget_key.as_deref() == Some(key.as_str()) {
            return Ok(());
        }
        data.widget_key = Some(key);
        self.persist(&data)
    }

    /// Merge `Set-Cookie` values from a response and persist if anything
    /// changed.
    pub fn absorb_cookies<'a>(
        &self,
        domain: &str,
        set_cookie_values: impl Iterator<Item = &'a str>,
    ) -> Result<(), PortalError> {
        let mut data = self.data.lock().expect("session mutex");
        let mut changed = false;

        for raw in set_cookie_values {
            let Some((name, value)) = parse_set_cookie(raw) else {
                continue;
            };

            match data
                .cookies
                .iter_mut()
                .find(|c| c.name == name && c.domain == domain)
            {
                Some(existing) if existing.value == value => {}
                Some(existing) => {
                    existing.value = value;
                    changed = true;
                }
                None => {
                    data.cookies.push(StoredCookie {
                        name,
                        value,
                        domain: domain.to_string(),
                    });
                    changed = true;
                }
            }
        }

        if changed {
            self.persist(&data)?;
        }
        Ok(())
    }

    /// `Cookie:` header value for a request to `host`, or None when no
    /// cookies apply.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let data = self.data.lock().expect("session mutex");
        let header = data
            .cookies
            .iter()
            .filter(|c| domain_matches(host, &c.domain))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }

    pub fn cookie_value(&self, name: &str) -> Option<String> {
        let data = self.data.lock().expect("session mutex");
        data.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    /// Drop all session state, on disk included. Called when the portal
    /// reports the session stale.
    pub fn clear(&self) -> Result<(), PortalError> {
        let mut data = self.data.lock().expect("session mutex");
        let apple_id = data.apple_id.clone();
        *data = SessionData::fresh(&apple_id);
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn persist(&self, data: &SessionData) -> Result<(), PortalError> {
        let dir = self
            .path
            .parent()
            .expect("session path has a parent directory");

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, data)?;
        tmp.flush()?;
        restrict_file(tmp.path())?;
        tmp.persist(&self.path)
            .map_err(|err| PortalError::Io(err.error))?;

        debug!("session persisted to {}", self.path.display());
        Ok(())
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

impl SessionData {
    fn fresh(apple_id: &str) -> Self {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);

        Self {
            apple_id: apple_id.to_string(),
            client_id: format!("auth-{}", hex::encode(bytes)),
            ..Default::default()
        }
    }
}

fn sanitize_apple_id(apple_id: &str) -> String {
    apple_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    // Apple bounces auth between idmsa.apple.com, appstoreconnect.apple.com
    // and developer.apple.com; cookies scoped to a parent domain apply to
    // all of them.
    host == cookie_domain
        || host.ends_with(&format!(".{cookie_domain}"))
        || cookie_domain.ends_with(".apple.com") && host.ends_with(".apple.com")
}

fn acquire_lock(lock_path: &Path) -> Result<(), PortalError> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut f) => {
            let _ = write!(f, "{}", std::process::id());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
            PortalError::SessionLocked(lock_path.display().to_string()),
        ),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<(), PortalError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<(), PortalError> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), PortalError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), PortalError> {
    Ok(())
}
