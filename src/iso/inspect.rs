//! Lightweight ISO 9660 inspection.
//!
//! Reads the primary volume descriptor directly from the image file (sector
//! 16) without mounting. Used both to pull the volume label out of the
//! reference image and to sanity-check produced images.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const SECTOR_SIZE: u64 = 2048;

/// Byte offset of the primary volume descriptor (sector 16).
pub const PVD_OFFSET: u64 = 16 * SECTOR_SIZE;

/// ISO 9660 standard identifier, bytes 1..6 of every volume descriptor.
pub const STANDARD_ID: &[u8; 5] = b"CD001";

/// Fields read from a primary volume descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryVolumeDescriptor {
    pub volume_label: String,
}

/// Read the primary volume descriptor from an image file.
///
/// Returns `Ok(None)` when the file is too short or carries no recognizable
/// ISO 9660 signature; `Err` only for I/O failures.
pub fn read_pvd(path: &Path) -> Result<Option<PrimaryVolumeDescriptor>> {
    let mut file =
        File::open(path).with_context(|| format!("opening image '{}'", path.display()))?;

    let len = file
        .metadata()
        .with_context(|| format!("reading metadata of '{}'", path.display()))?
        .len();
    if len < PVD_OFFSET + SECTOR_SIZE {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(PVD_OFFSET))
        .with_context(|| format!("seeking to volume descriptor in '{}'", path.display()))?;
    let mut sector = [0u8; SECTOR_SIZE as usize];
    file.read_exact(&mut sector)
        .with_context(|| format!("reading volume descriptor from '{}'", path.display()))?;

    // Descriptor type 1, standard identifier, version 1.
    if sector[0] != 1 || &sector[1..6] != STANDARD_ID || sector[6] != 1 {
        return Ok(None);
    }

    let volume_label = decode_field(&sector[40..72]);
    Ok(Some(PrimaryVolumeDescriptor { volume_label }))
}

/// Volume label of an image, if it carries a readable PVD.
pub fn read_volume_label(path: &Path) -> Result<Option<String>> {
    Ok(read_pvd(path)?.map(|pvd| pvd.volume_label))
}

/// Descriptor text fields are space-padded a-characters.
fn decode_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_label_from_valid_pvd() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("a.iso");
        test_support::write_fake_iso(&iso, "CCCOMA_X64FRE_EN-US_DV9", 64 * 2048);

        let pvd = read_pvd(&iso).unwrap().unwrap();
        assert_eq!(pvd.volume_label, "CCCOMA_X64FRE_EN-US_DV9");
    }

    #[test]
    fn short_file_has_no_pvd() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short.iso");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(read_pvd(&path).unwrap().is_none());
    }

    #[test]
    fn garbage_signature_has_no_pvd() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.iso");
        std::fs::write(&path, vec![0xFFu8; 18 * 2048]).unwrap();
        assert!(read_pvd(&path).unwrap().is_none());
    }
}
