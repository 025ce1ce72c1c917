// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external signer boundary.
//!
//! Cryptographic signature generation is not this tool's job: an
//! external `ldid`/`codesign`-style executable produces the signature
//! tree. The pipeline owns *when* the signer runs and *with what
//! inputs* (target, identity, resolved entitlements file), nothing more.

use {
    crate::error::{Result, WarpSignError},
    log::{debug, info},
    std::{
        path::{Path, PathBuf},
        process::Command,
        sync::Mutex,
    },
};

/// One signing request against an external signer.
#[derive(Clone, Debug)]
pub struct SignRequest {
    /// Bundle root or bare binary to sign.
    pub target: PathBuf,
    /// Certificate identity handed to the tool (common name or SHA-1).
    pub identity: String,
    /// Resolved entitlements plist, when the target carries any.
    pub entitlements: Option<PathBuf>,
}

pub trait CodeSigner: Sync {
    fn sign(&self, request: &SignRequest) -> Result<()>;
}

/// Spawns an external signing tool per request.
///
/// The argument shape follows codesign: `--force -s <identity>
/// [--entitlements <plist>] <target>`; `ldid`-style tools accept the
/// same surface through a wrapper script.
pub struct CommandSigner {
    program: PathBuf,
}

impl CommandSigner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CodeSigner for CommandSigner {
    fn sign(&self, request: &SignRequest) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.arg("--force").arg("-s").arg(&request.identity);

        if let Some(entitlements) = &request.entitlements {
            command.arg("--entitlements").arg(entitlements);
        }
        command.arg(&request.target);

        debug!("signing {} with {:?}", request.target.display(), command);

        let output = command.output().map_err(|err| WarpSignError::Signer {
            bundle: request.target.clone(),
            message: format!("could not launch {}: {err}", self.program.display()),
        })?;

        if !output.status.success() {
            // The tool's own words, with the bundle as context.
            return Err(WarpSignError::Signer {
                bundle: request.target.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("signed {}", request.target.display());
        Ok(())
    }
}

/// Test signer: records the order of invocations instead of signing.
#[derive(Default)]
pub struct RecordingSigner {
    invocations: Mutex<Vec<SignRequest>>,
}

impl RecordingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<SignRequest> {
        self.invocations.lock().expect("signer mutex").clone()
    }

    pub fn targets(&self) -> Vec<PathBuf> {
        self.invocations().into_iter().map(|r| r.target).collect()
    }
}

impl CodeSigner for RecordingSigner {
    fn sign(&self, request: &SignRequest) -> Result<()> {
        self.invocations
            .lock()
            .expect("signer mutex")
            .push(request.clone());
        Ok(())
    }
}

/// Signer that fails on selected targets; exercises partial-failure
/// paths in tests.
pub struct FailingSigner {
    pub fail_on: PathBuf,
}

impl CodeSigner for FailingSigner {
    fn sign(&self, request: &SignRequest) -> Result<()> {
        if request.target.ends_with(&self.fail_on) {
            return Err(WarpSignError::Signer {
                bundle: request.target.clone(),
                message: "refused by test signer".into(),
            });
        }
        Ok(())
    }
}

/// Validate a signer path early so the failure happens before any portal
/// mutation.
pub fn resolve_signer_program(program: &Path) -> Result<PathBuf> {
    if program.is_file() {
        return Ok(program.to_path_buf());
    }

    // Bare command names resolve through PATH at spawn time.
    if program.components().count() == 1 {
        return Ok(program.to_path_buf());
    }

    Err(WarpSignError::Config(format!(
        "signer executable not found: {}",
        program.display()
    )))
}
