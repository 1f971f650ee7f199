//! Built-in ISO 9660 writer.
//!
//! Last-resort authoring strategy used when every external tool has failed.
//! Writes a single-volume ISO 9660 image: primary volume descriptor, an
//! El Torito boot record pointing at the BIOS boot-sector file, L/M path
//! tables, directory extents, and file data, preserving the source tree's
//! relative paths.
//!
//! Deliberately modest: one extent per file (so files past 4 GiB are
//! skipped, as the original authoring library also had to), plain ISO 9660
//! identifiers without Joliet, and no multi-session support. External
//! strategies produce better images; this one only has to produce a
//! mountable, plausibly bootable image when nothing else is installed.

use crate::process::CancelFlag;
use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::inspect::{SECTOR_SIZE, STANDARD_ID};

const SECTOR: usize = SECTOR_SIZE as usize;

/// Single-extent limit of ISO 9660 (32-bit data length).
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Identifiers longer than this are skipped rather than mangled.
const MAX_ID_LEN: usize = 110;

/// Options for the built-in writer.
#[derive(Debug, Clone)]
pub struct WriterOptions<'a> {
    pub volume_label: &'a str,
    pub application_id: &'a str,
    pub publisher: &'a str,
    /// ISO-relative path of the El Torito boot image, e.g.
    /// `boot/etfsboot.com`. Omitted from the catalog when absent from the
    /// tree.
    pub boot_image: Option<&'a str>,
}

struct FileRec {
    id: String,
    src: PathBuf,
    size: u64,
    lba: u32,
}

struct Dir {
    id: String,
    parent: usize,
    subdirs: Vec<usize>,
    files: Vec<FileRec>,
    lba: u32,
    size: u32,
}

/// Write a bootable ISO 9660 image from `source_dir`. Returns the image
/// size in bytes.
pub fn write_iso(
    source_dir: &Path,
    output: &Path,
    options: &WriterOptions,
    cancel: &CancelFlag,
) -> Result<u64> {
    let mut dirs = scan_tree(source_dir)?;
    let layout = assign_layout(&mut dirs, options.boot_image.is_some())?;

    let boot_lba = match options.boot_image {
        Some(rel) => {
            let lba = find_boot_file(&dirs, source_dir, rel);
            if lba.is_none() {
                warn!("boot image '{}' not found in tree; writing without a boot catalog entry", rel);
            }
            lba
        }
        None => None,
    };

    let file = File::create(output)
        .with_context(|| format!("creating output image '{}'", output.display()))?;
    let mut out = BufWriter::new(file);

    // System area.
    write_zero_sectors(&mut out, 16)?;

    write_sector(&mut out, &build_pvd(&dirs, &layout, options))?;
    if let Some(catalog_lba) = layout.boot_catalog_lba {
        write_sector(&mut out, &build_boot_record(catalog_lba))?;
        write_sector(&mut out, &build_terminator())?;
        write_sector(&mut out, &build_boot_catalog(boot_lba))?;
    } else {
        write_sector(&mut out, &build_terminator())?;
    }

    write_padded(&mut out, &build_path_table(&dirs, false), layout.path_table_sectors)?;
    write_padded(&mut out, &build_path_table(&dirs, true), layout.path_table_sectors)?;

    for index in 0..dirs.len() {
        write_padded(
            &mut out,
            &build_dir_extent(&dirs, index),
            (dirs[index].size as usize) / SECTOR,
        )?;
    }

    for dir in &dirs {
        for file_rec in &dir.files {
            cancel.check()?;
            copy_file_padded(&mut out, file_rec)?;
        }
    }

    out.flush().context("flushing output image")?;
    Ok(layout.total_sectors as u64 * SECTOR_SIZE)
}

// ---------------------------------------------------------------------------
// Tree scan

fn scan_tree(source_dir: &Path) -> Result<Vec<Dir>> {
    let mut dirs = vec![Dir {
        id: String::new(),
        parent: 0,
        subdirs: Vec::new(),
        files: Vec::new(),
        lba: 0,
        size: 0,
    }];

    // Breadth-first with sorted children keeps the path table in the order
    // ISO 9660 mandates (level, then parent, then identifier).
    let mut queue: Vec<(usize, PathBuf)> = vec![(0, source_dir.to_path_buf())];
    let mut head = 0;
    while head < queue.len() {
        let (dir_index, dir_path) = queue[head].clone();
        head += 1;

        let mut entries: Vec<_> = fs::read_dir(&dir_path)
            .with_context(|| format!("reading directory '{}'", dir_path.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = iso_identifier(&name);
            if id.is_empty() || id.len() > MAX_ID_LEN {
                warn!("skipping '{}': name not representable in ISO 9660", name);
                continue;
            }

            if file_type.is_dir() {
                let child = dirs.len();
                dirs.push(Dir {
                    id,
                    parent: dir_index,
                    subdirs: Vec::new(),
                    files: Vec::new(),
                    lba: 0,
                    size: 0,
                });
                dirs[dir_index].subdirs.push(child);
                queue.push((child, entry.path()));
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                if size > MAX_FILE_SIZE {
                    warn!(
                        "skipping '{}': {} bytes exceeds the single-extent limit",
                        name, size
                    );
                    continue;
                }
                dirs[dir_index].files.push(FileRec {
                    id,
                    src: entry.path(),
                    size,
                    lba: 0,
                });
            }
            // Symlinks and specials are not representable; drop silently.
        }
    }
    Ok(dirs)
}

/// Map a name to a relaxed ISO 9660 identifier: uppercase, restricted
/// character set, no version suffix.
fn iso_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Layout

struct Layout {
    boot_catalog_lba: Option<u32>,
    path_table_lba_l: u32,
    path_table_lba_m: u32,
    path_table_bytes: u32,
    path_table_sectors: usize,
    total_sectors: u32,
}

fn assign_layout(dirs: &mut [Dir], with_boot: bool) -> Result<Layout> {
    // Descriptors: PVD at 16, optional boot record, terminator.
    let mut next: u32 = if with_boot { 19 } else { 18 };
    let boot_catalog_lba = if with_boot {
        let lba = next;
        next += 1;
        Some(lba)
    } else {
        None
    };

    let path_table_bytes: u32 = dirs
        .iter()
        .map(|d| path_table_entry_len(&d.id) as u32)
        .sum();
    let path_table_sectors = (path_table_bytes as usize).div_ceil(SECTOR).max(1);
    let path_table_lba_l = next;
    next += path_table_sectors as u32;
    let path_table_lba_m = next;
    next += path_table_sectors as u32;

    for index in 0..dirs.len() {
        let size = dir_extent_len(dirs, index);
        dirs[index].lba = next;
        dirs[index].size = size;
        next += size / SECTOR_SIZE as u32;
    }

    for dir in dirs.iter_mut() {
        for file_rec in &mut dir.files {
            let sectors = file_rec.size.div_ceil(SECTOR_SIZE) as u32;
            file_rec.lba = next;
            next = next
                .checked_add(sectors)
                .ok_or_else(|| anyhow::anyhow!("image exceeds ISO 9660 addressable size"))?;
        }
    }

    Ok(Layout {
        boot_catalog_lba,
        path_table_lba_l,
        path_table_lba_m,
        path_table_bytes,
        path_table_sectors,
        total_sectors: next,
    })
}

fn record_len(id_len: usize) -> usize {
    let len = 33 + id_len;
    len + (len % 2)
}

fn path_table_entry_len(id: &str) -> usize {
    let id_len = id.len().max(1);
    8 + id_len + (id_len % 2)
}

/// Directory extent length in bytes, sector-aligned; records never span a
/// sector boundary.
fn dir_extent_len(dirs: &[Dir], index: usize) -> u32 {
    let mut pos = record_len(1) * 2; // self + parent
    for (id, _, _, _) in sorted_children(dirs, index) {
        let len = record_len(id.len());
        if pos % SECTOR + len > SECTOR {
            pos = pos.div_ceil(SECTOR) * SECTOR;
        }
        pos += len;
    }
    (pos.div_ceil(SECTOR).max(1) * SECTOR) as u32
}

/// Children of a directory as (identifier, lba, size, is_dir), sorted by
/// identifier as the directory record order requires.
fn sorted_children(dirs: &[Dir], index: usize) -> Vec<(String, u32, u32, bool)> {
    let dir = &dirs[index];
    let mut children: Vec<(String, u32, u32, bool)> = Vec::new();
    for &sub in &dir.subdirs {
        children.push((dirs[sub].id.clone(), dirs[sub].lba, dirs[sub].size, true));
    }
    for file_rec in &dir.files {
        children.push((file_rec.id.clone(), file_rec.lba, file_rec.size as u32, false));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    children
}

fn find_boot_file(dirs: &[Dir], source_dir: &Path, boot_rel: &str) -> Option<u32> {
    let wanted: Vec<&str> = boot_rel.split('/').filter(|c| !c.is_empty()).collect();
    for dir in dirs {
        for file_rec in &dir.files {
            let rel = file_rec.src.strip_prefix(source_dir).ok()?;
            let components: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if components.len() == wanted.len()
                && components
                    .iter()
                    .zip(&wanted)
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
            {
                return Some(file_rec.lba);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Descriptor construction

fn both16(buf: &mut [u8], value: u16) {
    buf[0..2].copy_from_slice(&value.to_le_bytes());
    buf[2..4].copy_from_slice(&value.to_be_bytes());
}

fn both32(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_le_bytes());
    buf[4..8].copy_from_slice(&value.to_be_bytes());
}

fn put_str(buf: &mut [u8], text: &str) {
    for b in buf.iter_mut() {
        *b = b' ';
    }
    let bytes = text.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// 17-byte "not specified" timestamp.
fn blank_long_date(buf: &mut [u8]) {
    buf[..16].copy_from_slice(b"0000000000000000");
    buf[16] = 0;
}

fn build_pvd(dirs: &[Dir], layout: &Layout, options: &WriterOptions) -> [u8; SECTOR] {
    let mut pvd = [0u8; SECTOR];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(STANDARD_ID);
    pvd[6] = 1;
    put_str(&mut pvd[8..40], "");
    put_str(&mut pvd[40..72], &iso_identifier(options.volume_label));
    both32(&mut pvd[80..88], layout.total_sectors);
    both16(&mut pvd[120..124], 1); // volume set size
    both16(&mut pvd[124..128], 1); // volume sequence number
    both16(&mut pvd[128..132], SECTOR as u16);
    both32(&mut pvd[132..140], layout.path_table_bytes);
    pvd[140..144].copy_from_slice(&layout.path_table_lba_l.to_le_bytes());
    pvd[148..152].copy_from_slice(&layout.path_table_lba_m.to_be_bytes());
    build_dir_record(&mut pvd[156..190], &[0u8; 1], dirs[0].lba, dirs[0].size, true);
    put_str(&mut pvd[190..318], "");
    put_str(&mut pvd[318..446], options.publisher);
    put_str(&mut pvd[446..574], "");
    put_str(&mut pvd[574..702], options.application_id);
    put_str(&mut pvd[702..739], "");
    put_str(&mut pvd[739..776], "");
    put_str(&mut pvd[776..813], "");
    blank_long_date(&mut pvd[813..830]);
    blank_long_date(&mut pvd[830..847]);
    blank_long_date(&mut pvd[847..864]);
    blank_long_date(&mut pvd[864..881]);
    pvd[881] = 1;
    pvd
}

fn build_boot_record(catalog_lba: u32) -> [u8; SECTOR] {
    let mut brvd = [0u8; SECTOR];
    brvd[0] = 0;
    brvd[1..6].copy_from_slice(STANDARD_ID);
    brvd[6] = 1;
    let system_id = b"EL TORITO SPECIFICATION";
    brvd[7..7 + system_id.len()].copy_from_slice(system_id);
    brvd[0x47..0x4B].copy_from_slice(&catalog_lba.to_le_bytes());
    brvd
}

fn build_terminator() -> [u8; SECTOR] {
    let mut term = [0u8; SECTOR];
    term[0] = 255;
    term[1..6].copy_from_slice(STANDARD_ID);
    term[6] = 1;
    term
}

fn build_boot_catalog(boot_lba: Option<u32>) -> [u8; SECTOR] {
    let mut catalog = [0u8; SECTOR];

    // Validation entry: header 0x01, platform 0 (x86), key bytes 0x55 0xAA,
    // checksum chosen so the 16 little-endian words sum to zero.
    catalog[0] = 0x01;
    catalog[30] = 0x55;
    catalog[31] = 0xAA;
    let mut sum: u16 = 0;
    for word in catalog[0..32].chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]));
    }
    let checksum = 0u16.wrapping_sub(sum);
    catalog[28..30].copy_from_slice(&checksum.to_le_bytes());

    if let Some(lba) = boot_lba {
        // Initial/default entry: bootable, no emulation, 4 virtual sectors.
        catalog[32] = 0x88;
        catalog[33] = 0x00;
        catalog[34..36].copy_from_slice(&0u16.to_le_bytes()); // load segment (default 0x7C0)
        catalog[38..40].copy_from_slice(&4u16.to_le_bytes());
        catalog[40..44].copy_from_slice(&lba.to_le_bytes());
    }
    catalog
}

fn build_path_table(dirs: &[Dir], big_endian: bool) -> Vec<u8> {
    let mut table = Vec::new();
    for dir in dirs {
        let id_bytes: Vec<u8> = if dir.id.is_empty() {
            vec![0]
        } else {
            dir.id.as_bytes().to_vec()
        };
        // Path table indices are 1-based; BFS order matches array order.
        let parent = (dir.parent + 1) as u16;
        table.push(id_bytes.len() as u8);
        table.push(0);
        if big_endian {
            table.extend_from_slice(&dir.lba.to_be_bytes());
            table.extend_from_slice(&parent.to_be_bytes());
        } else {
            table.extend_from_slice(&dir.lba.to_le_bytes());
            table.extend_from_slice(&parent.to_le_bytes());
        }
        table.extend_from_slice(&id_bytes);
        if id_bytes.len() % 2 == 1 {
            table.push(0);
        }
    }
    table
}

fn build_dir_record(buf: &mut [u8], id: &[u8], lba: u32, size: u32, is_dir: bool) {
    let len = record_len(id.len());
    buf[0] = len as u8;
    buf[1] = 0;
    both32(&mut buf[2..10], lba);
    both32(&mut buf[10..18], size);
    // Recording date zeroed; authoring time is not load-bearing here.
    buf[25] = if is_dir { 0x02 } else { 0x00 };
    both16(&mut buf[28..32], 1);
    buf[32] = id.len() as u8;
    buf[33..33 + id.len()].copy_from_slice(id);
}

fn build_dir_extent(dirs: &[Dir], index: usize) -> Vec<u8> {
    let dir = &dirs[index];
    let parent = &dirs[dir.parent];
    let mut extent = vec![0u8; dir.size as usize];
    let mut pos = 0usize;

    let mut emit = |extent: &mut Vec<u8>, pos: &mut usize, id: &[u8], lba: u32, size: u32, is_dir: bool| {
        let len = record_len(id.len());
        if *pos % SECTOR + len > SECTOR {
            *pos = pos.div_ceil(SECTOR) * SECTOR;
        }
        build_dir_record(&mut extent[*pos..*pos + len], id, lba, size, is_dir);
        *pos += len;
    };

    emit(&mut extent, &mut pos, &[0u8], dir.lba, dir.size, true);
    emit(&mut extent, &mut pos, &[1u8], parent.lba, parent.size, true);
    for (id, lba, size, is_dir) in sorted_children(dirs, index) {
        emit(&mut extent, &mut pos, id.as_bytes(), lba, size, is_dir);
    }
    extent
}

// ---------------------------------------------------------------------------
// Output

fn write_zero_sectors<W: Write>(out: &mut W, count: usize) -> Result<()> {
    let zeros = [0u8; SECTOR];
    for _ in 0..count {
        out.write_all(&zeros)?;
    }
    Ok(())
}

fn write_sector<W: Write>(out: &mut W, sector: &[u8; SECTOR]) -> Result<()> {
    out.write_all(sector)?;
    Ok(())
}

/// Write `data` padded with zeros to exactly `sectors` sectors.
fn write_padded<W: Write>(out: &mut W, data: &[u8], sectors: usize) -> Result<()> {
    if data.len() > sectors * SECTOR {
        bail!("internal layout error: data larger than its allocation");
    }
    out.write_all(data)?;
    let pad = sectors * SECTOR - data.len();
    let zeros = [0u8; SECTOR];
    let mut remaining = pad;
    while remaining > 0 {
        let chunk = remaining.min(SECTOR);
        out.write_all(&zeros[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

fn copy_file_padded<W: Write>(out: &mut W, file_rec: &FileRec) -> Result<()> {
    let mut src = File::open(&file_rec.src)
        .with_context(|| format!("opening '{}'", file_rec.src.display()))?;
    let mut written = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    if written != file_rec.size {
        bail!(
            "'{}' changed size during authoring ({} != {})",
            file_rec.src.display(),
            written,
            file_rec.size
        );
    }
    let pad = (SECTOR_SIZE - written % SECTOR_SIZE) % SECTOR_SIZE;
    let zeros = [0u8; SECTOR];
    let mut remaining = pad as usize;
    while remaining > 0 {
        let chunk = remaining.min(SECTOR);
        out.write_all(&zeros[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::inspect;
    use crate::iso::validate::validate_image;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::create_dir_all(root.join("sources")).unwrap();
        fs::write(root.join("bootmgr"), vec![0xAAu8; 3000]).unwrap();
        fs::write(root.join("boot/etfsboot.com"), vec![0x55u8; 2048]).unwrap();
        fs::write(root.join("sources/boot.wim"), vec![1u8; 5000]).unwrap();
        fs::write(root.join("sources/install.wim"), vec![2u8; 9000]).unwrap();
    }

    fn options() -> WriterOptions<'static> {
        WriterOptions {
            volume_label: "CCCOMA_X64FRE_EN-US_DV9",
            application_id: "Microsoft Windows",
            publisher: "Microsoft Corporation",
            boot_image: Some("boot/etfsboot.com"),
        }
    }

    #[test]
    fn produces_a_validating_image() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        sample_tree(&tree);
        let output = temp.path().join("out.iso");

        let size = write_iso(&tree, &output, &options(), &CancelFlag::new()).unwrap();
        assert_eq!(size, fs::metadata(&output).unwrap().len());
        assert_eq!(size % SECTOR_SIZE, 0);

        let result = validate_image(&output, 19000, "CCCOMA_X64FRE_EN-US_DV9").unwrap();
        assert!(result.size_ok);
        assert!(result.structure_ok);
        assert!(result.volume_label_ok);
        assert!(result.overall_pass);
    }

    #[test]
    fn boot_record_points_at_catalog() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        sample_tree(&tree);
        let output = temp.path().join("out.iso");
        write_iso(&tree, &output, &options(), &CancelFlag::new()).unwrap();

        let mut file = File::open(&output).unwrap();
        // Boot record volume descriptor lives in sector 17.
        let mut brvd = [0u8; SECTOR];
        file.seek(SeekFrom::Start(17 * SECTOR_SIZE)).unwrap();
        file.read_exact(&mut brvd).unwrap();
        assert_eq!(brvd[0], 0);
        assert_eq!(&brvd[1..6], inspect::STANDARD_ID);
        assert_eq!(&brvd[7..30], b"EL TORITO SPECIFICATION");

        let catalog_lba = u32::from_le_bytes(brvd[0x47..0x4B].try_into().unwrap());
        let mut catalog = [0u8; SECTOR];
        file.seek(SeekFrom::Start(catalog_lba as u64 * SECTOR_SIZE))
            .unwrap();
        file.read_exact(&mut catalog).unwrap();
        assert_eq!(catalog[0], 0x01);
        assert_eq!(catalog[30], 0x55);
        assert_eq!(catalog[31], 0xAA);
        // Default entry is bootable, no emulation.
        assert_eq!(catalog[32], 0x88);
        assert_eq!(catalog[33], 0x00);

        // The entry's load RBA points at the boot image contents.
        let boot_lba = u32::from_le_bytes(catalog[40..44].try_into().unwrap());
        let mut first = [0u8; 16];
        file.seek(SeekFrom::Start(boot_lba as u64 * SECTOR_SIZE))
            .unwrap();
        file.read_exact(&mut first).unwrap();
        assert_eq!(first, [0x55u8; 16]);
    }

    #[test]
    fn validation_entry_checksum_is_zero_sum() {
        let catalog = build_boot_catalog(Some(40));
        let mut sum: u16 = 0;
        for word in catalog[0..32].chunks_exact(2) {
            sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]));
        }
        assert_eq!(sum, 0);
    }

    #[test]
    fn identifiers_are_uppercased_and_sanitized() {
        assert_eq!(iso_identifier("boot.wim"), "BOOT.WIM");
        assert_eq!(iso_identifier("autorun.inf"), "AUTORUN.INF");
        assert_eq!(iso_identifier("weird name!"), "WEIRD_NAME_");
    }

    #[test]
    fn empty_source_tree_still_produces_descriptors() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        let output = temp.path().join("empty.iso");

        let opts = WriterOptions {
            boot_image: None,
            ..options()
        };
        write_iso(&tree, &output, &opts, &CancelFlag::new()).unwrap();
        assert!(inspect::read_pvd(&output).unwrap().is_some());
    }

    #[test]
    fn cancellation_stops_the_writer() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        sample_tree(&tree);
        let output = temp.path().join("out.iso");

        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(write_iso(&tree, &output, &options(), &cancel).is_err());
    }
}
