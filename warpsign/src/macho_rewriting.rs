// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O image rewriting.
//!
//! Three mutations, all byte-surgical so everything the signer does not
//! regenerate stays bit-identical:
//!
//! * stripping `LC_CODE_SIGNATURE` (the external signer re-adds it),
//!   which compacts the load-command area and shrinks `__LINKEDIT`;
//! * rewriting identifier strings inside the `__TEXT,__info_plist`
//!   section, bounded by the section size;
//! * equal-length identifier replacement across the whole image for
//!   CFString data and other registered identifiers.
//!
//! Fat binaries are handled slice by slice with original offsets
//! preserved; slices only ever shrink.

use {
    crate::error::{Result, WarpSignError},
    goblin::mach::{constants::SEG_TEXT, load_command::CommandVariant, Mach, MachO},
    log::{debug, info, warn},
    scroll::Endian,
    std::path::{Path, PathBuf},
};

/// SuperBlob magic of the embedded XML entitlements blob.
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

/// 32-bit fat header magic (big-endian on disk).
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;

/// Byte offsets of `ncmds` / `sizeofcmds` in the Mach-O header.
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

const SECT_INFO_PLIST: &str = "__info_plist";

/// An equal-length or plist-scoped identifier substitution.
#[derive(Clone, Debug)]
pub struct Replacement {
    pub old: String,
    pub new: String,
}

/// A Mach-O file loaded for rewriting.
pub struct MachImage {
    path: PathBuf,
    data: Vec<u8>,
}

impl MachImage {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let image = Self {
            path: path.to_path_buf(),
            data,
        };
        // Parse up front so later passes can assume well-formedness.
        image.validate()?;
        Ok(image)
    }

    pub fn from_bytes(path: PathBuf, data: Vec<u8>) -> Result<Self> {
        let image = Self { path, data };
        image.validate()?;
        Ok(image)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn write(&self) -> Result<()> {
        std::fs::write(&self.path, &self.data)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        match Mach::parse(&self.data) {
            Ok(Mach::Binary(macho)) => {
                if is_encrypted(&macho) {
                    return Err(self.unsupported("image is FairPlay-encrypted"));
                }
                Ok(())
            }
            Ok(Mach::Fat(fat)) => {
                if u32::from_be_bytes(self.data[0..4].try_into().unwrap()) == FAT_MAGIC_64 {
                    return Err(self.unsupported("fat64 wrappers are not supported"));
                }
                for (index, arch) in fat.iter_arches().enumerate() {
                    let arch = arch?;
                    let slice = self.slice_bytes(arch.offset as usize, arch.size as usize)?;
                    let macho = MachO::parse(slice, 0)?;
                    if is_encrypted(&macho) {
                        return Err(
                            self.unsupported(&format!("slice {index} is FairPlay-encrypted"))
                        );
                    }
                }
                Ok(())
            }
            Err(err) => Err(self.unsupported(&err.to_string())),
        }
    }

    fn slice_bytes(&self, offset: usize, size: usize) -> Result<&[u8]> {
        self.data
            .get(offset..offset + size)
            .ok_or_else(|| self.unsupported("fat slice exceeds file bounds"))
    }

    fn unsupported(&self, reason: &str) -> WarpSignError {
        WarpSignError::UnsupportedMachO {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Entitlements embedded in the code signature, when present.
    ///
    /// The blob is self-describing (magic + length + XML plist), so a
    /// linear scan finds it without walking the signature superblob; the
    /// first slice's blob wins for fat binaries, matching how iOS loads
    /// them.
    pub fn entitlements(&self) -> Option<plist::Dictionary> {
        let blob = find_entitlements_blob(&self.data)?;
        match crate::plist_io::from_bytes(blob) {
            Ok(plist::Value::Dictionary(dict)) => Some(dict),
            _ => None,
        }
    }

    /// Remove `LC_CODE_SIGNATURE` from every slice. Returns true when at
    /// least one slice carried a signature.
    pub fn strip_code_signature(&mut self) -> Result<bool> {
        let mut any = false;
        self.for_each_slice(|path, slice| {
            let stripped = strip_slice_signature(path, slice)?;
            any |= stripped;
            Ok(())
        })?;

        if any {
            info!("stripped code signature from {}", self.path.display());
        }
        Ok(any)
    }

    /// Rewrite identifiers inside `__TEXT,__info_plist`.
    ///
    /// Only this section is touched: arbitrary text-section replacements
    /// shift code offsets and are refused by design of the format, not
    /// of this tool. Fails with [WarpSignError::IdentifierTooLong] when
    /// the rewritten plist no longer fits the section.
    pub fn patch_embedded_info_plist(&mut self, replacements: &[Replacement]) -> Result<u32> {
        let mut patched = 0u32;
        self.for_each_slice(|path, slice| {
            patched += patch_slice_info_plist(path, slice, replacements)?;
            Ok(())
        })?;

        if patched > 0 {
            debug!(
                "rewrote {} identifier(s) in embedded Info.plist of {}",
                patched,
                self.path.display()
            );
        }
        Ok(patched)
    }

    /// Equal-length replacement across the raw image. The caller is
    /// responsible for ordering patterns longest-first.
    pub fn patch_equal_length(&mut self, replacements: &[Replacement]) -> Result<u32> {
        let mut total = 0u32;

        for replacement in replacements {
            let old = replacement.old.as_bytes();
            let new = replacement.new.as_bytes();
            if old.len() != new.len() {
                return Err(WarpSignError::BundleLayout(format!(
                    "length-changing binary patch refused: {} -> {}",
                    replacement.old, replacement.new
                )));
            }

            total += replace_all(&mut self.data, old, new);
        }

        if total > 0 {
            debug!(
                "patched {} identifier occurrence(s) in {}",
                total,
                self.path.display()
            );
        }
        Ok(total)
    }

    /// Run `op` over every Mach-O slice, rebuilding the fat wrapper when
    /// slices shrink. Offsets of the slices never move.
    fn for_each_slice(
        &mut self,
        mut op: impl FnMut(&Path, &mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let magic = u32::from_be_bytes(
            self.data
                .get(0..4)
                .ok_or_else(|| self.unsupported("file too small"))?
                .try_into()
                .unwrap(),
        );

        if magic != FAT_MAGIC {
            let mut slice = std::mem::take(&mut self.data);
            let result = op(&self.path, &mut slice);
            self.data = slice;
            return result;
        }

        let arches: Vec<(usize, usize)> = match Mach::parse(&self.data)? {
            Mach::Fat(fat) => fat
                .iter_arches()
                .map(|arch| arch.map(|a| (a.offset as usize, a.size as usize)))
                .collect::<std::result::Result<_, _>>()?,
            Mach::Binary(_) => unreachable!("magic said fat"),
        };

        for (index, (offset, size)) in arches.iter().enumerate() {
            let mut slice = self.slice_bytes(*offset, *size)?.to_vec();
            op(&self.path, &mut slice)?;

            if slice.len() > *size {
                return Err(self.unsupported("slice rewrite would grow a fat member"));
            }

            // Write back at the original offset, zero the vacated tail,
            // and record the new size in the fat_arch table.
            self.data[*offset..*offset + slice.len()].copy_from_slice(&slice);
            for byte in &mut self.data[*offset + slice.len()..*offset + *size] {
                *byte = 0;
            }

            // fat_arch entries are 20 bytes each after the 8-byte header;
            // the size field sits at +12, big-endian.
            let size_field_offset = 8 + index * 20 + 12;
            self.data[size_field_offset..size_field_offset + 4]
                .copy_from_slice(&(slice.len() as u32).to_be_bytes());
        }

        Ok(())
    }
}

fn is_encrypted(macho: &MachO) -> bool {
    macho.load_commands.iter().any(|lc| match lc.command {
        CommandVariant::EncryptionInfo32(info) => info.cryptid != 0,
        CommandVariant::EncryptionInfo64(info) => info.cryptid != 0,
        _ => false,
    })
}

/// Locate the XML entitlements blob by its magic + length header.
fn find_entitlements_blob(data: &[u8]) -> Option<&[u8]> {
    let magic = CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes();

    let mut pos = 0;
    while let Some(found) = find_bytes(&data[pos..], &magic) {
        let start = pos + found;
        if start + 8 <= data.len() {
            let length =
                u32::from_be_bytes(data[start + 4..start + 8].try_into().unwrap()) as usize;
            if length > 8 && start + length <= data.len() {
                return Some(&data[start + 8..start + length]);
            }
        }
        pos = start + 4;
    }
    None
}

/// Strip the signature load command from one thin slice.
fn strip_slice_signature(path: &Path, slice: &mut Vec<u8>) -> Result<bool> {
    let macho = MachO::parse(slice, 0)?;

    let endian = slice_endian(slice, path)?;
    let header_is_64 = matches!(
        u32::from_le_bytes(slice[0..4].try_into().unwrap()),
        MH_MAGIC_64
    ) || matches!(u32::from_be_bytes(slice[0..4].try_into().unwrap()), MH_MAGIC_64);

    let mut signature: Option<(usize, u32, u32, u32)> = None;
    let mut linkedit: Option<(usize, bool, u64, u64, u64)> = None;

    for lc in &macho.load_commands {
        match lc.command {
            CommandVariant::CodeSignature(cmd) => {
                signature = Some((lc.offset, cmd.cmdsize, cmd.dataoff, cmd.datasize));
            }
            CommandVariant::Segment64(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                linkedit = Some((lc.offset, true, seg.vmsize, seg.fileoff, seg.filesize));
            }
            CommandVariant::Segment32(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                linkedit = Some((
                    lc.offset,
                    false,
                    seg.vmsize as u64,
                    seg.fileoff as u64,
                    seg.filesize as u64,
                ));
            }
            _ => {}
        }
    }

    let Some((sig_offset, sig_cmdsize, dataoff, datasize)) = signature else {
        return Ok(false);
    };

    let ncmds = macho.header.ncmds as u32;
    let sizeofcmds = macho.header.sizeofcmds;
    let header_size = if header_is_64 { 32 } else { 28 };

    // Shrink __LINKEDIT first, while recorded command offsets are valid.
    // The signature blob terminates the segment (and usually the file).
    if let Some((le_offset, is_64, vmsize, fileoff, filesize)) = linkedit {
        let blob_end = dataoff as u64 + datasize as u64;
        let seg_end = fileoff + filesize;

        if dataoff as u64 >= fileoff && blob_end >= seg_end.saturating_sub(16) {
            let shrink = seg_end - dataoff as u64;
            let new_filesize = filesize - shrink;
            let new_vmsize = vmsize.saturating_sub(shrink);

            if is_64 {
                write_u64(slice, le_offset + 32, new_vmsize, endian)?;
                write_u64(slice, le_offset + 48, new_filesize, endian)?;
            } else {
                write_u32(slice, le_offset + 28, new_vmsize as u32, endian)?;
                write_u32(slice, le_offset + 36, new_filesize as u32, endian)?;
            }
        } else {
            warn!(
                "{}: signature blob does not terminate __LINKEDIT; segment bounds left alone",
                path.display()
            );
        }
    }

    // Compact the load-command region over the removed command and zero
    // the vacated tail so the area stays well-formed padding.
    let cmds_end = header_size + sizeofcmds as usize;
    let removed = sig_cmdsize as usize;
    slice.copy_within(sig_offset + removed..cmds_end, sig_offset);
    for byte in &mut slice[cmds_end - removed..cmds_end] {
        *byte = 0;
    }

    write_u32(slice, NCMDS_OFFSET, ncmds - 1, endian)?;
    write_u32(slice, SIZEOFCMDS_OFFSET, sizeofcmds - sig_cmdsize, endian)?;

    // Drop the blob itself when it runs to end of slice.
    if dataoff as usize <= slice.len() && dataoff as usize + datasize as usize >= slice.len() {
        slice.truncate(dataoff as usize);
    }

    Ok(true)
}

/// Rewrite identifier strings within one slice's embedded Info.plist
/// section.
fn patch_slice_info_plist(
    path: &Path,
    slice: &mut Vec<u8>,
    replacements: &[Replacement],
) -> Result<u32> {
    let macho = MachO::parse(slice, 0)?;

    let mut section: Option<(usize, usize)> = None;
    for segment in &macho.segments {
        if segment.name().map(|n| n != SEG_TEXT).unwrap_or(true) {
            continue;
        }
        for (sect, _) in segment.sections()?.iter() {
            if sect.name().map(|n| n == SECT_INFO_PLIST).unwrap_or(false) {
                section = Some((sect.offset as usize, sect.size as usize));
            }
        }
    }

    let Some((offset, size)) = section else {
        return Ok(0);
    };
    if offset + size > slice.len() {
        return Err(WarpSignError::UnsupportedMachO {
            path: path.to_path_buf(),
            reason: "__info_plist section exceeds file bounds".into(),
        });
    }

    // Work on the logical content: the section may carry zero padding
    // after the plist text.
    let raw = &slice[offset..offset + size];
    let content_len = raw.iter().rposition(|&b| b != 0).map(|p| p + 1).unwrap_or(0);
    let mut content = raw[..content_len].to_vec();

    let mut count = 0u32;
    for replacement in replacements {
        count += replace_all(
            &mut content,
            replacement.old.as_bytes(),
            replacement.new.as_bytes(),
        );
    }

    if count == 0 {
        return Ok(0);
    }

    if content.len() > size {
        // No headroom left in the section; a shorter prefix is the only
        // way out for the caller.
        let longest = replacements
            .iter()
            .map(|r| r.new.as_str())
            .max_by_key(|s| s.len())
            .unwrap_or_default();
        return Err(WarpSignError::IdentifierTooLong {
            identifier: longest.to_string(),
            length: content.len(),
            limit: size,
        });
    }

    slice[offset..offset + content.len()].copy_from_slice(&content);
    for byte in &mut slice[offset + content.len()..offset + size] {
        *byte = 0;
    }

    Ok(count)
}

fn slice_endian(slice: &[u8], path: &Path) -> Result<Endian> {
    let le = u32::from_le_bytes(slice[0..4].try_into().unwrap());
    match le {
        MH_MAGIC | MH_MAGIC_64 => Ok(Endian::Little),
        _ => {
            let be = u32::from_be_bytes(slice[0..4].try_into().unwrap());
            match be {
                MH_MAGIC | MH_MAGIC_64 => Ok(Endian::Big),
                _ => Err(WarpSignError::UnsupportedMachO {
                    path: path.to_path_buf(),
                    reason: "unrecognized magic".into(),
                }),
            }
        }
    }
}

fn write_u32(slice: &mut [u8], offset: usize, value: u32, endian: Endian) -> Result<()> {
    let end = offset
        .checked_add(4)
        .filter(|&end| end <= slice.len())
        .ok_or_else(|| WarpSignError::BundleLayout("header patch out of bounds".into()))?;
    let bytes = if endian.is_little() {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    slice[offset..end].copy_from_slice(&bytes);
    Ok(())
}

fn write_u64(slice: &mut [u8], offset: usize, value: u64, endian: Endian) -> Result<()> {
    let end = offset
        .checked_add(8)
        .filter(|&end| end <= slice.len())
        .ok_or_else(|| WarpSignError::BundleLayout("header patch out of bounds".into()))?;
    let bytes = if endian.is_little() {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    slice[offset..end].copy_from_slice(&bytes);
    Ok(())
}

/// Replace every occurrence of `old` with `new`, returning the count.
/// `new` may differ in length; callers bound the result themselves.
fn replace_all(buffer: &mut Vec<u8>, old: &[u8], new: &[u8]) -> u32 {
    if old.is_empty() {
        return 0;
    }

    let mut count = 0;
    let mut search_from = 0;
    while let Some(found) = find_bytes(&buffer[search_from..], old) {
        let at = search_from + found;
        buffer.splice(at..at + old.len(), new.iter().copied());
        search_from = at + new.len();
        count += 1;
    }
    count
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
