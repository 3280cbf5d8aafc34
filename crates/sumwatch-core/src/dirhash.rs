//! The h1 directory hash over module zips.
//!
//! The module system's canonical zip hash: sort the archive's file names,
//! then SHA-256 the lines `"<hex sha256 of file>  <name>\n"` and emit
//! `"h1:" ‖ base64(sum)`. A [`HashFixer`] can rewrite entry contents
//! before hashing, which is how darwin toolchains are compared after
//! Apple's re-signing.

use std::io::{Read, Seek};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zip::ZipArchive;

use crate::darwin::{DarwinError, HashFixer};
use crate::hex;

/// Errors from hashing a zip archive.
#[derive(Debug, Error)]
pub enum DirhashError {
    /// The archive could not be read.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// I/O failure while reading archive contents.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hash fixer rejected an entry.
    #[error(transparent)]
    Fix(#[from] DarwinError),

    /// An entry name contains a newline, which the h1 form cannot encode.
    #[error("zip entry name contains newline: {0:?}")]
    NewlineInName(String),
}

/// Computes the h1 hash of a zip archive, applying `fixer` to each entry
/// before hashing its contents.
///
/// # Errors
///
/// Returns a [`DirhashError`] if the archive is unreadable, an entry name
/// contains a newline, or the fixer fails.
pub fn hash_zip_reader<R: Read + Seek>(
    reader: R,
    fixer: HashFixer,
) -> Result<String, DirhashError> {
    let mut archive = ZipArchive::new(reader)?;

    let mut names: Vec<(String, usize)> = (0..archive.len())
        .map(|i| Ok((archive.by_index(i)?.name().to_string(), i)))
        .collect::<Result<_, DirhashError>>()?;
    names.sort();

    let mut outer = Sha256::new();
    for (name, index) in names {
        if name.contains('\n') {
            return Err(DirhashError::NewlineInName(name));
        }
        let mut contents = Vec::new();
        archive.by_index(index)?.read_to_end(&mut contents)?;
        let contents = fixer.apply(&name, contents)?;
        let file_hash = Sha256::digest(&contents);
        outer.update(format!("{}  {name}\n", hex::encode(&file_hash)));
    }

    Ok(format!("h1:{}", STANDARD.encode(outer.finalize())))
}

/// Computes the h1 hash of a zip file on disk.
///
/// # Errors
///
/// See [`hash_zip_reader`].
pub fn hash_zip(path: &Path, fixer: HashFixer) -> Result<String, DirhashError> {
    let file = std::fs::File::open(path)?;
    hash_zip_reader(std::io::BufReader::new(file), fixer)
}

/// Formats a raw SHA-256 as the `h1:` form used in log records.
#[must_use]
pub fn format_hash1(sha256: &[u8]) -> String {
    format!("h1:{}", STANDARD.encode(sha256))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use zip::CompressionMethod;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn build_zip(entries: &[(&str, &[u8])]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn hash_is_independent_of_archive_order() {
        let a = build_zip(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let b = build_zip(&[("b.txt", b"beta"), ("a.txt", b"alpha")]);
        assert_eq!(
            hash_zip_reader(a, HashFixer::None).unwrap(),
            hash_zip_reader(b, HashFixer::None).unwrap()
        );
    }

    #[test]
    fn hash_changes_with_contents_and_names() {
        let base = hash_zip_reader(build_zip(&[("a.txt", b"alpha")]), HashFixer::None).unwrap();
        let other_contents =
            hash_zip_reader(build_zip(&[("a.txt", b"beta")]), HashFixer::None).unwrap();
        let other_name =
            hash_zip_reader(build_zip(&[("b.txt", b"alpha")]), HashFixer::None).unwrap();
        assert_ne!(base, other_contents);
        assert_ne!(base, other_name);
        assert!(base.starts_with("h1:"));
    }

    #[test]
    fn matches_hand_computed_h1() {
        let zip = build_zip(&[("m@v1/a.txt", b"alpha")]);

        let inner = Sha256::digest(b"alpha");
        let line = format!("{}  m@v1/a.txt\n", hex::encode(&inner));
        let expected = format!("h1:{}", STANDARD.encode(Sha256::digest(line.as_bytes())));

        assert_eq!(hash_zip_reader(zip, HashFixer::None).unwrap(), expected);
    }

    #[test]
    fn rejects_newline_in_name() {
        let zip = build_zip(&[("bad\nname", b"x")]);
        assert!(matches!(
            hash_zip_reader(zip, HashFixer::None),
            Err(DirhashError::NewlineInName(_))
        ));
    }

    #[test]
    fn fixer_affects_hash_of_binaries_only() {
        // A fake Mach-O that the stripper rewrites when under bin/.
        let macho = {
            let mut data = vec![0xcf, 0xfa, 0xed, 0xfe];
            data.extend_from_slice(&[0u8; 12]);
            data.extend_from_slice(&4u32.to_le_bytes());
            data.extend_from_slice(&184u32.to_le_bytes());
            data.extend_from_slice(&[0u8; 8]);
            // __TEXT segment
            data.extend_from_slice(&0x19u32.to_le_bytes());
            data.extend_from_slice(&72u32.to_le_bytes());
            data.extend_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0");
            data.extend_from_slice(&[0u8; 48]);
            // __LINKEDIT segment
            data.extend_from_slice(&0x19u32.to_le_bytes());
            data.extend_from_slice(&72u32.to_le_bytes());
            data.extend_from_slice(b"__LINKEDIT\0\0\0\0\0\0");
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&100u64.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&100u64.to_le_bytes());
            data.extend_from_slice(&[0u8; 16]);
            // LC_SYMTAB
            data.extend_from_slice(&0x2u32.to_le_bytes());
            data.extend_from_slice(&24u32.to_le_bytes());
            data.extend_from_slice(&[0u8; 16]);
            // LC_CODE_SIGNATURE at offset 240, 16 bytes
            data.extend_from_slice(&0x1du32.to_le_bytes());
            data.extend_from_slice(&16u32.to_le_bytes());
            data.extend_from_slice(&240u32.to_le_bytes());
            data.extend_from_slice(&16u32.to_le_bytes());
            data.resize(240, 0xab);
            data.extend_from_slice(&[0xcd; 16]);
            data
        };

        let signed = build_zip(&[("golang.org/toolchain@v/bin/go", &macho)]);
        let plain = hash_zip_reader(signed, HashFixer::None).unwrap();
        let signed = build_zip(&[("golang.org/toolchain@v/bin/go", &macho)]);
        let fixed = hash_zip_reader(signed, HashFixer::StripDarwinSig).unwrap();
        assert_ne!(plain, fixed);

        // Outside bin/, the fixer leaves the entry alone.
        let elsewhere = build_zip(&[("golang.org/toolchain@v/src/go", &macho)]);
        let plain_src = hash_zip_reader(elsewhere, HashFixer::None).unwrap();
        let elsewhere = build_zip(&[("golang.org/toolchain@v/src/go", &macho)]);
        let fixed_src = hash_zip_reader(elsewhere, HashFixer::StripDarwinSig).unwrap();
        assert_eq!(plain_src, fixed_src);
    }
}
