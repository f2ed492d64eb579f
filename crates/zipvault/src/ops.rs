use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::crc32::crc32;
use crate::expand::{expand, Expansion};
use crate::reader::read_central_directory;
use crate::store::{now_ms, VaultStore};
use crate::zip::ZipWriter;
use crate::{ArchiveEntry, FileRecord, FolderRecord};

/// Packs a folder's subtree into a new archive record stored next to the
/// folder. Returns the new record's id, or None when nothing was packable.
pub fn compress_folder<S: VaultStore>(store: &mut S, folder_id: &str) -> Result<Option<String>> {
    let folders = store.folders()?;
    let files = store.files()?;
    let Some(root) = folders.iter().find(|f| f.id == folder_id) else {
        bail!("Folder not found");
    };

    let mut eligible = descendant_folder_ids(&folders, &root.id);
    eligible.insert(root.id.clone());

    let mut writer = ZipWriter::new(Vec::new());
    let mut sidecar: Vec<ArchiveEntry> = Vec::new();
    let now = now_ms();
    for file in files.iter() {
        let Some(folder) = file.folder_id.as_deref().filter(|id| eligible.contains(*id)) else {
            continue;
        };
        let Some(src) = store.fetch(&file.id)? else {
            continue;
        };
        let path = path_segments(&folders, &root.id, folder);
        let mut parts = path.clone();
        parts.push(file.name.clone());
        let modified = if src.modified_ms == 0 { now } else { src.modified_ms };
        writer.push(&parts.join("/"), modified, &src.bytes)?;
        sidecar.push(ArchiveEntry {
            file_id: file.id.clone(),
            path,
        });
    }

    if writer.entry_count() == 0 {
        return Ok(None);
    }
    let bytes = writer.finish()?;
    let size = bytes.len() as u64;
    let url = store.put_blob(bytes)?;
    let id = format!("fil-{}", store.mint_token());
    store.insert_file(FileRecord {
        id: id.clone(),
        name: format!("{}.zip", root.name),
        size,
        kind: "application/zip".to_string(),
        url,
        last_modified: now,
        folder_id: root.parent_id.clone(),
        selected: false,
        favorite: false,
        created_at: now,
        opened_at: None,
        name_modified_at: None,
        archive_of_folder_id: Some(root.id.clone()),
        archive_entries: Some(sidecar),
    })?;
    Ok(Some(id))
}

/// Re-encodes an archive from its current sources and hands back the bytes,
/// regenerating the record's url/size/modified stamp. Plain files and
/// archives whose sources all vanished yield the stored bytes unchanged.
pub fn rebuild_archive<S: VaultStore>(store: &mut S, file_id: &str) -> Result<Vec<u8>> {
    let files = store.files()?;
    let Some(record) = files.iter().find(|f| f.id == file_id) else {
        bail!("File not found");
    };
    if !(record.is_zip() && record.has_archive_entries()) {
        return stored_bytes(store, record);
    }

    let entries = record.archive_entries.clone().unwrap_or_default();
    let mut writer = ZipWriter::new(Vec::new());
    let now = now_ms();
    for entry in &entries {
        let Some(orig) = files.iter().find(|f| f.id == entry.file_id) else {
            continue;
        };
        let Some(src) = store.fetch(&orig.id)? else {
            continue;
        };
        let mut parts = entry.path.clone();
        parts.push(orig.name.clone());
        let modified = if src.modified_ms == 0 { now } else { src.modified_ms };
        writer.push(&parts.join("/"), modified, &src.bytes)?;
    }
    if writer.entry_count() == 0 {
        return stored_bytes(store, record);
    }

    let bytes = writer.finish()?;
    let url = store.put_blob(bytes.clone())?;
    let mut updated = record.clone();
    updated.url = url;
    updated.size = bytes.len() as u64;
    updated.last_modified = now;
    store.update_file(updated)?;
    Ok(bytes)
}

/// Materializes an archive's entry metadata as folder/file records next to
/// the archive, inserting them into the store as one batch.
pub fn extract_archive<S: VaultStore>(store: &mut S, file_id: &str) -> Result<Expansion> {
    let folders = store.folders()?;
    let files = store.files()?;
    let Some(record) = files.iter().find(|f| f.id == file_id).cloned() else {
        bail!("File not found");
    };
    let expansion = expand(&record, &folders, &files, now_ms(), || store.mint_token());
    store.insert_batch(&expansion.folders, &expansion.files)?;
    Ok(expansion)
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct VerifyReport {
    pub matched: Vec<String>,
    pub mismatched: Vec<Mismatch>,
    pub missing_from_bytes: Vec<String>,
    pub extra_in_bytes: Vec<String>,
    /// sidecar entries whose source is gone, listed but not checkable
    pub unverifiable: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub name: String,
    pub expected_size: u64,
    pub actual_size: u64,
    pub expected_crc: u32,
    pub actual_crc: u32,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty()
            && self.missing_from_bytes.is_empty()
            && self.extra_in_bytes.is_empty()
    }
}

/// Advisory cross-check of an archive's stored bytes against its sidecar and
/// the sources as they exist now. Extraction never depends on this.
pub fn verify_archive<S: VaultStore>(store: &S, file_id: &str) -> Result<VerifyReport> {
    let files = store.files()?;
    let Some(record) = files.iter().find(|f| f.id == file_id) else {
        bail!("File not found");
    };
    let Some(stored) = store.fetch(&record.id)? else {
        bail!("File data is missing");
    };
    let actual = read_central_directory(&stored.bytes)?;

    let mut report = VerifyReport::default();
    let mut claimed: HashSet<String> = HashSet::new();
    let entries = record.archive_entries.clone().unwrap_or_default();
    for entry in &entries {
        let Some(orig) = files.iter().find(|f| f.id == entry.file_id) else {
            report.unverifiable.push(entry.file_id.clone());
            continue;
        };
        let mut parts = entry.path.clone();
        parts.push(orig.name.clone());
        let name = parts.join("/");
        claimed.insert(name.clone());
        let found = actual.iter().find(|cd| cd.name == name);
        let Some(src) = store.fetch(&orig.id)? else {
            match found {
                Some(_) => report.unverifiable.push(name),
                None => report.missing_from_bytes.push(name),
            }
            continue;
        };
        match found {
            None => report.missing_from_bytes.push(name),
            Some(cd) => {
                let expected_crc = crc32(&src.bytes);
                let expected_size = src.bytes.len() as u64;
                if cd.crc32 == expected_crc && cd.uncompressed_size as u64 == expected_size {
                    report.matched.push(name);
                } else {
                    report.mismatched.push(Mismatch {
                        name,
                        expected_size,
                        actual_size: cd.uncompressed_size as u64,
                        expected_crc,
                        actual_crc: cd.crc32,
                    });
                }
            }
        }
    }
    for cd in &actual {
        if !claimed.contains(&cd.name) {
            report.extra_in_bytes.push(cd.name.clone());
        }
    }
    Ok(report)
}

fn stored_bytes<S: VaultStore>(store: &S, record: &FileRecord) -> Result<Vec<u8>> {
    match store.fetch(&record.id)? {
        Some(src) => Ok(src.bytes),
        None => bail!("File data is missing"),
    }
}

fn descendant_folder_ids(folders: &[FolderRecord], root_id: &str) -> HashSet<String> {
    let mut result = HashSet::new();
    let mut stack = vec![root_id.to_string()];
    while let Some(cur) = stack.pop() {
        for child in folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == Some(cur.as_str()))
        {
            if result.insert(child.id.clone()) {
                stack.push(child.id.clone());
            }
        }
    }
    result
}

fn path_segments(folders: &[FolderRecord], root_id: &str, folder_id: &str) -> Vec<String> {
    let mut segs = Vec::new();
    let mut cur = folder_id.to_string();
    while cur != root_id {
        let Some(folder) = folders.iter().find(|f| f.id == cur) else {
            break;
        };
        segs.push(folder.name.clone());
        match &folder.parent_id {
            Some(parent) => cur = parent.clone(),
            None => break,
        }
    }
    segs.reverse();
    segs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    const MARCH_MS: i64 = 1_710_506_096_000;

    fn store_with_tree() -> (MemStore, String) {
        let mut store = MemStore::new();
        let photos = store.create_folder("Photos", None);
        let raw = store.create_folder("raw", Some(photos.clone()));
        store.add_file(
            "top.txt",
            "text/plain",
            Some(photos.clone()),
            MARCH_MS,
            b"top level".to_vec(),
        );
        store.add_file(
            "one.raw",
            "application/octet-stream",
            Some(raw),
            MARCH_MS,
            b"raw one".to_vec(),
        );
        (store, photos)
    }

    fn file_id_by_name(store: &MemStore, name: &str) -> String {
        store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.name == name)
            .unwrap()
            .id
            .clone()
    }

    #[test]
    fn compress_creates_an_archive_record() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();

        let files = store.files().unwrap();
        assert_eq!(files.len(), 3);
        let record = files.iter().find(|f| f.id == id).unwrap();
        assert_eq!(record.name, "Photos.zip");
        assert_eq!(record.kind, "application/zip");
        assert_eq!(record.folder_id, None);
        assert_eq!(record.archive_of_folder_id.as_deref(), Some(photos.as_str()));

        let sidecar = record.archive_entries.as_ref().unwrap();
        assert_eq!(sidecar.len(), 2);
        assert!(sidecar.iter().any(|e| e.path.is_empty()));
        assert!(sidecar.iter().any(|e| e.path == ["raw"]));

        let bytes = store.fetch(&id).unwrap().unwrap().bytes;
        assert_eq!(record.size, bytes.len() as u64);
        let listed = read_central_directory(&bytes).unwrap();
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["top.txt", "raw/one.raw"]);
        assert_eq!(listed[0].crc32, crc32(b"top level"));
        assert_eq!(listed[1].uncompressed_size, 7);
    }

    #[test]
    fn compress_empty_folder_creates_nothing() {
        let mut store = MemStore::new();
        let empty = store.create_folder("Empty", None);
        assert!(compress_folder(&mut store, &empty).unwrap().is_none());
        assert!(store.files().unwrap().is_empty());
    }

    #[test]
    fn compress_unknown_folder_errors() {
        let mut store = MemStore::new();
        assert!(compress_folder(&mut store, "nope").is_err());
    }

    #[test]
    fn compress_drops_unfetchable_sources_from_zip_and_sidecar() {
        let (mut store, photos) = store_with_tree();
        let mut broken = store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.name == "one.raw")
            .unwrap()
            .clone();
        broken.url = "blob:nowhere".to_string();
        store.update_file(broken).unwrap();

        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        let files = store.files().unwrap();
        let record = files.iter().find(|f| f.id == id).unwrap();
        let sidecar = record.archive_entries.as_ref().unwrap();
        assert_eq!(sidecar.len(), 1);

        let bytes = store.fetch(&id).unwrap().unwrap().bytes;
        let listed = read_central_directory(&bytes).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "top.txt");
    }

    #[test]
    fn rebuild_plain_file_returns_stored_bytes() {
        let (mut store, _) = store_with_tree();
        let id = file_id_by_name(&store, "top.txt");
        assert_eq!(rebuild_archive(&mut store, &id).unwrap(), b"top level");
    }

    #[test]
    fn rebuild_reencodes_current_sources() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        let first = store.fetch(&id).unwrap().unwrap().bytes;
        let old_url = store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.id == id)
            .unwrap()
            .url
            .clone();

        let mut edited = store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.name == "top.txt")
            .unwrap()
            .clone();
        edited.url = store.put_blob(b"top level, edited".to_vec()).unwrap();
        store.update_file(edited).unwrap();

        let rebuilt = rebuild_archive(&mut store, &id).unwrap();
        assert_ne!(rebuilt, first);

        let files = store.files().unwrap();
        let record = files.iter().find(|f| f.id == id).unwrap();
        assert_ne!(record.url, old_url);
        assert_eq!(record.size, rebuilt.len() as u64);

        let listed = read_central_directory(&rebuilt).unwrap();
        assert_eq!(listed[0].crc32, crc32(b"top level, edited"));
    }

    #[test]
    fn rebuild_falls_back_when_all_sources_vanished() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        let original = store.fetch(&id).unwrap().unwrap().bytes;
        let url_before = store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.id == id)
            .unwrap()
            .url
            .clone();

        store.trash_file(&file_id_by_name(&store, "top.txt")).unwrap();
        store.trash_file(&file_id_by_name(&store, "one.raw")).unwrap();

        let bytes = rebuild_archive(&mut store, &id).unwrap();
        assert_eq!(bytes, original);
        let files = store.files().unwrap();
        assert_eq!(files.iter().find(|f| f.id == id).unwrap().url, url_before);
    }

    #[test]
    fn extract_rebuilds_the_tree_beside_the_archive() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();

        let expansion = extract_archive(&mut store, &id).unwrap();
        // "Photos" is taken by the source folder, so the root dodges it
        assert_eq!(expansion.folders[0].name, "Photos (1)");
        assert_eq!(expansion.folders.len(), 2);
        assert_eq!(expansion.files.len(), 2);

        let folders = store.folders().unwrap();
        assert_eq!(folders.len(), 4);
        let files = store.files().unwrap();
        assert_eq!(files.len(), 5);

        let top_dup = files
            .iter()
            .find(|f| f.name == "top.txt" && f.folder_id.as_deref() == Some(expansion.root_folder_id.as_str()))
            .unwrap();
        let top_orig = files
            .iter()
            .find(|f| f.name == "top.txt" && f.id != top_dup.id)
            .unwrap();
        assert_eq!(top_dup.url, top_orig.url);
    }

    #[test]
    fn extract_skips_vanished_sources() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        store.trash_file(&file_id_by_name(&store, "one.raw")).unwrap();

        let expansion = extract_archive(&mut store, &id).unwrap();
        assert_eq!(expansion.files.len(), 1);
        assert_eq!(expansion.files[0].name, "top.txt");
        // the skipped entry's "raw" segment is never materialized
        assert_eq!(expansion.folders.len(), 1);
    }

    #[test]
    fn verify_clean_archive() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        let report = verify_archive(&store, &id).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.matched.len(), 2);
        assert!(report.unverifiable.is_empty());
    }

    #[test]
    fn verify_flags_edited_sources() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();

        let mut edited = store
            .files()
            .unwrap()
            .iter()
            .find(|f| f.name == "top.txt")
            .unwrap()
            .clone();
        edited.url = store.put_blob(b"rewritten".to_vec()).unwrap();
        store.update_file(edited).unwrap();

        let report = verify_archive(&store, &id).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].name, "top.txt");
        assert_eq!(report.mismatched[0].actual_crc, crc32(b"top level"));
        assert_eq!(report.mismatched[0].expected_crc, crc32(b"rewritten"));
        assert_eq!(report.matched, ["raw/one.raw"]);
    }

    #[test]
    fn verify_reports_deleted_sources() {
        let (mut store, photos) = store_with_tree();
        let id = compress_folder(&mut store, &photos).unwrap().unwrap();
        let gone = file_id_by_name(&store, "one.raw");
        store.delete_file(&gone).unwrap();

        let report = verify_archive(&store, &id).unwrap();
        assert_eq!(report.unverifiable, [gone]);
        assert_eq!(report.extra_in_bytes, ["raw/one.raw"]);
        assert!(!report.is_clean());
    }
}
