// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property list reading and writing.
//!
//! Wraps the `plist` crate with the small amount of policy this tool
//! needs: transparent XML/binary detection on load, explicit choice of
//! encoding on save, and a round-trip check used before any plist is
//! rewritten in place. Dictionaries keep first-seen key order throughout,
//! which is what makes unchanged re-emission deterministic.

use {
    crate::error::{Result, WarpSignError},
    plist::Value,
    std::{
        io::Cursor,
        path::Path,
    },
};

/// Magic prefix of a binary property list.
const BPLIST_MAGIC: &[u8] = b"bplist00";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlistFormat {
    Xml,
    Binary,
}

pub fn detect_format(bytes: &[u8]) -> PlistFormat {
    if bytes.starts_with(BPLIST_MAGIC) {
        PlistFormat::Binary
    } else {
        PlistFormat::Xml
    }
}

/// Parse a plist from bytes, either encoding.
pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
    Ok(Value::from_reader(Cursor::new(bytes))?)
}

pub fn load(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path)?;
    from_bytes(&bytes)
}

/// Load a plist whose root must be a dictionary (Info.plist,
/// entitlements).
pub fn load_dictionary(path: &Path) -> Result<plist::Dictionary> {
    match load(path)? {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(WarpSignError::PlistRoundTrip(path.to_path_buf())),
    }
}

pub fn to_xml_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    value.to_writer_xml(&mut out)?;
    Ok(out)
}

pub fn to_binary_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    value.to_writer_binary(&mut out)?;
    Ok(out)
}

/// Write preserving the encoding the file already uses.
pub fn save_matching(path: &Path, value: &Value) -> Result<()> {
    let format = match std::fs::read(path) {
        Ok(existing) => detect_format(&existing),
        Err(_) => PlistFormat::Xml,
    };

    let bytes = match format {
        PlistFormat::Xml => to_xml_bytes(value)?,
        PlistFormat::Binary => to_binary_bytes(value)?,
    };

    verify_round_trip(value, &bytes, path)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn save_xml(path: &Path, value: &Value) -> Result<()> {
    let bytes = to_xml_bytes(value)?;
    verify_round_trip(value, &bytes, path)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Decode what we are about to write and compare; a mismatch means the
/// emitted bytes would not faithfully carry the value.
fn verify_round_trip(value: &Value, encoded: &[u8], path: &Path) -> Result<()> {
    let reparsed = from_bytes(encoded)
        .map_err(|_| WarpSignError::PlistRoundTrip(path.to_path_buf()))?;
    if &reparsed != value {
        return Err(WarpSignError::PlistRoundTrip(path.to_path_buf()));
    }
    Ok(())
}
