// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPA container handling.
//!
//! An IPA is a zip archive with a single app bundle under `Payload/`.
//! Frameworks ship symlinks and executables rely on their mode bits, so
//! extraction and repacking must preserve both. Entry names are validated
//! against directory escapes before anything touches the filesystem.

use {
    crate::error::{Result, WarpSignError},
    log::{debug, info},
    std::{
        fs::{self, File},
        io::{self, Read, Write},
        path::{Path, PathBuf},
    },
    walkdir::WalkDir,
    zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter},
};

/// Unix file-type bits marking a symlink in a zip entry's mode.
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

/// Extract `ipa` into `dest` and return the path of the app bundle root.
///
/// `dest` should be a scratch directory private to this run; it is
/// created `0700` when missing.
pub fn extract_ipa(ipa: &Path, dest: &Path) -> Result<PathBuf> {
    if !ipa.is_file() {
        return Err(WarpSignError::ArchiveUnreadable(ipa.to_path_buf()));
    }

    fs::create_dir_all(dest)?;
    restrict_dir(dest)?;

    let file = File::open(ipa).map_err(|_| WarpSignError::ArchiveUnreadable(ipa.to_path_buf()))?;
    let mut archive = ZipArchive::new(file)?;

    info!("extracting {} ({} entries)", ipa.display(), archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        // enclosed_name rejects absolute paths and `..` components.
        let Some(relative) = entry.enclosed_name() else {
            debug!("skipping zip entry with hostile name: {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = entry.unix_mode();

        if mode.map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false) {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            make_symlink(&target, &out_path)?;
            continue;
        }

        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        if let Some(mode) = mode {
            apply_mode(&out_path, mode)?;
        }
    }

    locate_app_root(dest)
}

/// The extracted tree must contain exactly one `Payload/<name>.app`.
fn locate_app_root(dest: &Path) -> Result<PathBuf> {
    let payload = dest.join("Payload");
    if !payload.is_dir() {
        return Err(WarpSignError::BundleLayout(
            "archive has no Payload directory".into(),
        ));
    }

    let mut apps = Vec::new();
    for entry in fs::read_dir(&payload)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.extension().map(|e| e == "app").unwrap_or(false) {
            apps.push(path);
        }
    }

    match apps.len() {
        1 => Ok(apps.remove(0)),
        0 => Err(WarpSignError::BundleLayout(
            "no .app bundle under Payload".into(),
        )),
        n => Err(WarpSignError::BundleLayout(format!(
            "expected one app bundle under Payload, found {n}"
        ))),
    }
}

/// Repack `app_dir` (a `.app` bundle root) into an IPA at `output`.
pub fn pack_ipa(app_dir: &Path, output: &Path) -> Result<()> {
    let app_name = app_dir
        .file_name()
        .ok_or_else(|| WarpSignError::BundleLayout("app bundle has no name".into()))?
        .to_string_lossy()
        .to_string();

    info!("packing {} -> {}", app_dir.display(), output.display());

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(output)?;
    let mut writer = ZipWriter::new(file);

    // Sorted walk keeps output deterministic across runs.
    for entry in WalkDir::new(app_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            WarpSignError::BundleLayout(format!("walking {}: {e}", app_dir.display()))
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(app_dir)
            .expect("walkdir yields children of its root");
        let archive_name = format!("Payload/{app_name}/{}", unix_path(relative));

        let metadata = fs::symlink_metadata(path)?;

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .unix_permissions(S_IFLNK | 0o755);
            writer.start_file(archive_name, options)?;
            writer.write_all(unix_path(&target).as_bytes())?;
            continue;
        }

        if metadata.is_dir() {
            if path != app_dir {
                let options =
                    SimpleFileOptions::default().unix_permissions(mode_of(&metadata, 0o755));
                writer.add_directory(format!("{archive_name}/"), options)?;
            }
            continue;
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode_of(&metadata, 0o644));
        writer.start_file(archive_name, options)?;

        let mut input = File::open(path)?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

fn unix_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata, fallback: u32) -> u32 {
    fallback
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    if link.exists() || fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    // Without symlink support, materialise the target path as a file so
    // the tree stays navigable.
    fs::write(link, target)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}
