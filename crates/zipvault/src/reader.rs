use std::io::{Cursor, Read};

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::zip::{CENTRAL_DIR_HEADER_SIG, EOCD_LEN, EOCD_SIG};

#[derive(Debug, Clone)]
pub struct CdEntry {
    pub name: String,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub local_offset: u32,
}

/// Walks the central directory of an in-memory archive. Inspection only,
/// entry data is never touched.
pub fn read_central_directory(bytes: &[u8]) -> Result<Vec<CdEntry>> {
    let Some(eocd) = find_eocd(bytes) else {
        bail!("No end of central directory record");
    };
    let mut io = Cursor::new(bytes);
    io.set_position(eocd as u64 + 4);
    let disk = io.read_u16::<LittleEndian>()?;
    let cd_disk = io.read_u16::<LittleEndian>()?;
    if disk != 0 || cd_disk != 0 {
        bail!("Multi volume archives aren't supported");
    }
    let _on_this_disk = io.read_u16::<LittleEndian>()?;
    let count = io.read_u16::<LittleEndian>()?;
    let cd_size = io.read_u32::<LittleEndian>()? as u64;
    let cd_offset = io.read_u32::<LittleEndian>()? as u64;
    if cd_offset + cd_size > eocd as u64 {
        bail!("Central directory runs past its end record");
    }

    let mut entries = Vec::with_capacity(count as usize);
    io.set_position(cd_offset);
    for _ in 0..count {
        if io.read_u32::<LittleEndian>()? != CENTRAL_DIR_HEADER_SIG {
            bail!("Central directory entry has a bad signature");
        }
        let _version_made_by = io.read_u16::<LittleEndian>()?;
        let _version_needed = io.read_u16::<LittleEndian>()?;
        let _flags = io.read_u16::<LittleEndian>()?;
        let method = io.read_u16::<LittleEndian>()?;
        let dos_time = io.read_u16::<LittleEndian>()?;
        let dos_date = io.read_u16::<LittleEndian>()?;
        let crc32 = io.read_u32::<LittleEndian>()?;
        let compressed_size = io.read_u32::<LittleEndian>()?;
        let uncompressed_size = io.read_u32::<LittleEndian>()?;
        let name_len = io.read_u16::<LittleEndian>()? as usize;
        let extra_len = io.read_u16::<LittleEndian>()? as u64;
        let comment_len = io.read_u16::<LittleEndian>()? as u64;
        let _disk_start = io.read_u16::<LittleEndian>()?;
        let _internal_attrs = io.read_u16::<LittleEndian>()?;
        let _external_attrs = io.read_u32::<LittleEndian>()?;
        let local_offset = io.read_u32::<LittleEndian>()?;
        let mut name = vec![0u8; name_len];
        io.read_exact(&mut name)?;
        io.set_position(io.position() + extra_len + comment_len);
        entries.push(CdEntry {
            name: String::from_utf8_lossy(&name).into_owned(),
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            local_offset,
        });
    }
    Ok(entries)
}

fn find_eocd(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < EOCD_LEN {
        return None;
    }
    let search_start = bytes.len().saturating_sub(EOCD_LEN + 65_535);
    (search_start..=bytes.len() - EOCD_LEN)
        .rev()
        .find(|&offset| bytes[offset..offset + 4] == EOCD_SIG.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc32::crc32;
    use crate::zip::{build_zip, ZipEntry};

    fn sample() -> Vec<u8> {
        build_zip(&[
            ZipEntry {
                name: "notes/today.txt".to_string(),
                data: b"first".to_vec(),
                modified_ms: 1_710_506_096_000,
            },
            ZipEntry {
                name: "cover.png".to_string(),
                data: vec![0x89, 0x50, 0x4E, 0x47],
                modified_ms: 1_710_506_096_000,
            },
        ])
        .unwrap()
    }

    #[test]
    fn lists_written_entries() {
        let entries = read_central_directory(&sample()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "notes/today.txt");
        assert_eq!(entries[0].uncompressed_size, 5);
        assert_eq!(entries[0].crc32, crc32(b"first"));
        assert_eq!(entries[0].method, 0);
        assert_eq!(entries[1].name, "cover.png");
        assert_eq!(entries[1].local_offset, 30 + 15 + 5);
    }

    #[test]
    fn empty_archive_lists_nothing() {
        let bytes = build_zip(&[]).unwrap();
        assert!(read_central_directory(&bytes).unwrap().is_empty());
    }

    #[test]
    fn finds_end_record_behind_trailing_bytes() {
        let mut bytes = sample();
        bytes.extend_from_slice(b"sixteen byte tail");
        let entries = read_central_directory(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn rejects_non_archives() {
        assert!(read_central_directory(b"not a zip at all").is_err());
        assert!(read_central_directory(b"").is_err());
    }
}
