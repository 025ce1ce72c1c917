// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unified error type for the signing pipeline.

use {developer_portal::PortalError, std::path::PathBuf, thiserror::Error};

#[derive(Debug, Error)]
pub enum WarpSignError {
    // User errors (exit 1).
    #[error("archive not found or unreadable: {0}")]
    ArchiveUnreadable(PathBuf),

    #[error("wildcard identifiers are not supported: {0}")]
    WildcardIdentifier(String),

    #[error("contradictory flags: {0}")]
    ContradictoryFlags(String),

    #[error("configuration problem: {0}")]
    Config(String),

    #[error("no configuration found; run `warpsign setup` first")]
    SetupRequired,

    // Auth / portal errors (exit 2).
    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error("capability {capability} is required by {entitlement} but unavailable to this team")]
    CapabilityUnavailable {
        capability: String,
        entitlement: String,
    },

    // Bundle errors (exit 3).
    #[error("nested identifier relation broken: {child} is not prefixed by {parent}")]
    NestedIdentifierMismatch { parent: String, child: String },

    #[error("identifier too long ({length} bytes, limit {limit}): {identifier}")]
    IdentifierTooLong {
        identifier: String,
        length: usize,
        limit: usize,
    },

    #[error("unsupported Mach-O in {path}: {reason}")]
    UnsupportedMachO { path: PathBuf, reason: String },

    #[error("plist round-trip failed for {0}")]
    PlistRoundTrip(PathBuf),

    #[error("bundle layout problem: {0}")]
    BundleLayout(String),

    // Signer errors (exit 3).
    #[error("signer failed on {bundle}: {message}")]
    Signer { bundle: PathBuf, message: String },

    // Cancellation (exit 4).
    #[error("cancelled")]
    Cancelled,

    // Ambient conversions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Mach-O parse error: {0}")]
    Goblin(#[from] goblin::error::Error),
}

pub type Result<T> = std::result::Result<T, WarpSignError>;

impl WarpSignError {
    /// Process exit code per the CLI contract: 1 user error, 2 portal
    /// failure, 3 signing/bundle failure, 4 cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ArchiveUnreadable(_)
            | Self::WildcardIdentifier(_)
            | Self::ContradictoryFlags(_)
            | Self::Config(_)
            | Self::SetupRequired => 1,

            Self::Portal(_) | Self::CapabilityUnavailable { .. } => 2,

            Self::NestedIdentifierMismatch { .. }
            | Self::IdentifierTooLong { .. }
            | Self::UnsupportedMachO { .. }
            | Self::PlistRoundTrip(_)
            | Self::BundleLayout(_)
            | Self::Signer { .. }
            | Self::Io(_)
            | Self::Plist(_)
            | Self::Zip(_)
            | Self::Goblin(_) => 3,

            Self::Cancelled => 4,
        }
    }
}
