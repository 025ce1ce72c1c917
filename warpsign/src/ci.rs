// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CI hand-off boundary.
//!
//! `sign-ci` does not run the pipeline locally; it packages the request
//! and hands it to an external CI collaborator. Only the contract lives
//! here: the collaborator (workflow dispatch, artifact transfer) is out
//! of scope and plugs in through [CiRunner].

use {
    crate::{
        config::WarpSignConfig,
        error::{Result, WarpSignError},
        pipeline::SignOptions,
    },
    std::path::PathBuf,
};

/// Everything a remote runner needs to reproduce a `sign` invocation.
#[derive(Clone, Debug)]
pub struct CiSignRequest {
    pub ipa: PathBuf,
    pub repository: String,
    pub workflow: String,
    pub options: SignOptions,
}

pub trait CiRunner {
    /// Dispatch the request and return a human-readable run reference
    /// (URL or id).
    fn dispatch(&self, request: &CiSignRequest) -> Result<String>;
}

/// Build the hand-off request, validating the CI configuration keys.
pub fn build_request(
    ipa: PathBuf,
    config: &WarpSignConfig,
    options: SignOptions,
) -> Result<CiSignRequest> {
    if config.github_token.as_deref().unwrap_or_default().is_empty() {
        return Err(WarpSignError::Config(
            "sign-ci requires github_token in config.toml".into(),
        ));
    }

    let repository = config
        .repository
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            WarpSignError::Config("sign-ci requires repository in config.toml".into())
        })?;

    let workflow = config
        .workflow
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WarpSignError::Config("sign-ci requires workflow in config.toml".into()))?;

    Ok(CiSignRequest {
        ipa,
        repository,
        workflow,
        options,
    })
}
