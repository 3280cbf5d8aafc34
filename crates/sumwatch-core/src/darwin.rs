//! macOS code-signature stripping for toolchain binaries.
//!
//! Apple notarization re-signs the Mach-O binaries inside darwin
//! toolchain zips after they are hashed into the log, so a rebuilt
//! toolchain can only be compared byte-for-byte once the signatures are
//! removed. [`strip_darwin_sig`] undoes exactly what the signer did: it
//! deletes a trailing `LC_CODE_SIGNATURE` load command, shrinks the
//! `__LINKEDIT` segment by the signature size (memory size set equal to
//! file size, unrounded, matching how the toolchain was originally
//! linked), and truncates the file at the signature offset.
//!
//! Inputs that are not 64-bit Mach-O files, are outside `bin/` and
//! `pkg/tool/`, or carry no signature are returned unchanged.

use thiserror::Error;

/// Mach-O 64-bit little-endian magic, as it appears on disk.
const MACHO64_MAGIC: [u8; 4] = [0xcf, 0xfa, 0xed, 0xfe];

const LC_SEGMENT_64: u32 = 0x19;
const LC_CODE_SIGNATURE: u32 = 0x1d;

/// Header offsets.
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;
const LOADS_OFFSET: usize = 32;

/// Errors from Mach-O surgery on a file that looked like a signed binary.
#[derive(Debug, Error)]
pub enum DarwinError {
    /// The load command table is truncated or self-inconsistent.
    #[error("macho {0}: malformed load commands")]
    MalformedLoads(String),

    /// The file has fewer load commands than any real binary.
    #[error("macho {0}: too few loads")]
    TooFewLoads(String),

    /// The code signature offset points outside the file.
    #[error("macho {0}: invalid signature")]
    InvalidSignature(String),

    /// No `__LINKEDIT` segment was found.
    #[error("macho {0}: cannot find __LINKEDIT")]
    NoLinkedit(String),
}

/// Per-target adjustment applied to zip entries before dirhashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashFixer {
    /// Hash file contents as they are.
    #[default]
    None,

    /// Strip macOS code signatures from Mach-O binaries first.
    StripDarwinSig,
}

impl HashFixer {
    /// Applies the fixer to one archive entry.
    ///
    /// # Errors
    ///
    /// Returns a [`DarwinError`] if a signed Mach-O binary turns out to be
    /// structurally malformed.
    pub fn apply(self, name: &str, data: Vec<u8>) -> Result<Vec<u8>, DarwinError> {
        match self {
            Self::None => Ok(data),
            Self::StripDarwinSig => strip_darwin_sig(name, data),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("slice is 4 bytes")))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes(b.try_into().expect("slice is 8 bytes")))
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Strips the macOS code signature from a Mach-O executable.
///
/// `name` is the archive path of the entry (always forward slashes).
/// Files outside `bin/` and `pkg/tool/`, files that are not 64-bit
/// Mach-O, and binaries without a trailing code signature are returned
/// unchanged. The operation is idempotent.
///
/// # Errors
///
/// Returns a [`DarwinError`] when a signed binary cannot be edited
/// safely.
pub fn strip_darwin_sig(name: &str, mut data: Vec<u8>) -> Result<Vec<u8>, DarwinError> {
    // Binaries only live in bin/ and pkg/tool/.
    if !name.contains("/bin/") && !name.contains("/pkg/tool/") {
        return Ok(data);
    }
    if data.len() < 4 || data[..4] != MACHO64_MAGIC {
        return Ok(data);
    }

    let ncmds = read_u32(&data, NCMDS_OFFSET)
        .ok_or_else(|| DarwinError::MalformedLoads(name.to_string()))?;
    if ncmds < 4 {
        return Err(DarwinError::TooFewLoads(name.to_string()));
    }

    // Walk the load command table, remembering each command's offset.
    let mut load_offsets = Vec::with_capacity(ncmds as usize);
    let mut offset = LOADS_OFFSET;
    for _ in 0..ncmds {
        let cmdsize = read_u32(&data, offset + 4)
            .ok_or_else(|| DarwinError::MalformedLoads(name.to_string()))? as usize;
        if cmdsize < 8 || offset + cmdsize > data.len() {
            return Err(DarwinError::MalformedLoads(name.to_string()));
        }
        load_offsets.push(offset);
        offset += cmdsize;
    }

    // LC_CODE_SIGNATURE must be the last load. Not having one is fine.
    let last = *load_offsets.last().expect("ncmds >= 4");
    let last_cmd = read_u32(&data, last).expect("offset bounds checked");
    let last_size = read_u32(&data, last + 4).expect("offset bounds checked");
    if last_cmd != LC_CODE_SIGNATURE || last_size != 16 {
        return Ok(data);
    }
    let sig_off = read_u32(&data, last + 8).expect("offset bounds checked") as usize;
    let sig_size = read_u32(&data, last + 12).expect("offset bounds checked");
    if sig_off >= data.len() {
        return Err(DarwinError::InvalidSignature(name.to_string()));
    }

    // Locate the __LINKEDIT segment (3rd or 4th load, usually).
    let linkedit = load_offsets
        .iter()
        .copied()
        .find(|&off| {
            read_u32(&data, off) == Some(LC_SEGMENT_64)
                && data.get(off + 8..off + 24).map(|segname| {
                    segname.starts_with(b"__LINKEDIT")
                        && segname[b"__LINKEDIT".len()..].iter().all(|&b| b == 0)
                }) == Some(true)
        })
        .ok_or_else(|| DarwinError::NoLinkedit(name.to_string()))?;
    // vmsize lives after cmd, cmdsize, segname, and vmaddr.
    let link_off = linkedit + 4 + 4 + 16 + 8;
    if link_off + 32 > data.len() {
        return Err(DarwinError::NoLinkedit(name.to_string()));
    }

    // __LINKEDIT shrinks by the signature size; memory size is set equal
    // to file size, unrounded, because that is how Go links it.
    let file_size = read_u64(&data, link_off + 16)
        .expect("bounds checked above")
        .checked_sub(u64::from(sig_size))
        .ok_or_else(|| DarwinError::InvalidSignature(name.to_string()))?;

    // Point of no return: edit data to strip the signature.

    write_u32(&mut data, NCMDS_OFFSET, ncmds - 1);
    let sizeofcmds = read_u32(&data, SIZEOFCMDS_OFFSET).expect("header bounds checked");
    write_u32(&mut data, SIZEOFCMDS_OFFSET, sizeofcmds.saturating_sub(16));
    data[last..last + 16].fill(0);

    write_u64(&mut data, link_off, file_size);
    write_u64(&mut data, link_off + 16, file_size);

    data.truncate(sig_off);
    Ok(data)
}
