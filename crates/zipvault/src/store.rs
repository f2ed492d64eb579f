use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{FileRecord, FolderRecord};

pub struct SourceBytes {
    pub bytes: Vec<u8>,
    pub modified_ms: i64,
}

/// The record store the archive operations run against. Snapshot reads,
/// sequential fetches, one batch write per operation.
pub trait VaultStore {
    fn folders(&self) -> Result<Vec<FolderRecord>>;
    fn files(&self) -> Result<Vec<FileRecord>>;
    /// Ok(None) means the source is gone, callers drop the entry.
    fn fetch(&self, file_id: &str) -> Result<Option<SourceBytes>>;
    fn mint_token(&mut self) -> String;
    fn put_blob(&mut self, bytes: Vec<u8>) -> Result<String>;
    fn insert_file(&mut self, file: FileRecord) -> Result<()>;
    fn insert_batch(&mut self, folders: &[FolderRecord], files: &[FileRecord]) -> Result<()>;
    fn update_file(&mut self, file: FileRecord) -> Result<()>;
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, PartialEq, Decode, Encode, Serialize, Deserialize, Clone)]
pub struct Blob {
    pub url: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, PartialEq, Decode, Encode, Serialize, Deserialize, Clone, Default)]
pub struct Snapshot {
    pub folders: Vec<FolderRecord>,
    pub files: Vec<FileRecord>,
    pub trash: Vec<FileRecord>,
    pub blobs: Vec<Blob>,
    pub seq: u64,
}

mod base64_bytes {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    folders: Vec<FolderRecord>,
    files: Vec<FileRecord>,
    trash: Vec<FileRecord>,
    blobs: HashMap<String, Vec<u8>>,
    seq: u64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            folders: snapshot.folders,
            files: snapshot.files,
            trash: snapshot.trash,
            blobs: snapshot
                .blobs
                .into_iter()
                .map(|b| (b.url, b.bytes))
                .collect(),
            seq: snapshot.seq,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut blobs: Vec<Blob> = self
            .blobs
            .iter()
            .map(|(url, bytes)| Blob {
                url: url.clone(),
                bytes: bytes.clone(),
            })
            .collect();
        blobs.sort_by(|a, b| a.url.cmp(&b.url));
        Snapshot {
            folders: self.folders.clone(),
            files: self.files.clone(),
            trash: self.trash.clone(),
            blobs,
            seq: self.seq,
        }
    }

    pub fn create_folder(&mut self, name: &str, parent_id: Option<String>) -> String {
        let id = format!("fld-{}", self.mint_token());
        self.folders.push(FolderRecord {
            id: id.clone(),
            name: name.to_string(),
            parent_id,
            selected: false,
            favorite: false,
        });
        id
    }

    pub fn add_file(
        &mut self,
        name: &str,
        kind: &str,
        folder_id: Option<String>,
        modified_ms: i64,
        bytes: Vec<u8>,
    ) -> String {
        let size = bytes.len() as u64;
        let url = format!("blob:{}", self.mint_token());
        self.blobs.insert(url.clone(), bytes);
        let id = format!("fil-{}", self.mint_token());
        self.files.push(FileRecord {
            id: id.clone(),
            name: name.to_string(),
            size,
            kind: kind.to_string(),
            url,
            last_modified: modified_ms,
            folder_id,
            selected: false,
            favorite: false,
            created_at: now_ms(),
            opened_at: None,
            name_modified_at: None,
            archive_of_folder_id: None,
            archive_entries: None,
        });
        id
    }

    pub fn folder_by_path(&self, path: &str) -> Option<&FolderRecord> {
        let mut parent: Option<String> = None;
        let mut found: Option<&FolderRecord> = None;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            let folder = self
                .folders
                .iter()
                .find(|f| f.parent_id == parent && f.name == seg)?;
            parent = Some(folder.id.clone());
            found = Some(folder);
        }
        found
    }

    pub fn file_by_path(&self, path: &str) -> Option<&FileRecord> {
        let (dir, name) = match path.rfind('/') {
            Some(at) => (&path[..at], &path[at + 1..]),
            None => ("", path),
        };
        let folder_id = if dir.is_empty() {
            None
        } else {
            Some(self.folder_by_path(dir)?.id.clone())
        };
        self.files
            .iter()
            .find(|f| f.folder_id == folder_id && f.name == name)
    }

    pub fn trashed(&self) -> &[FileRecord] {
        &self.trash
    }

    pub fn trash_file(&mut self, file_id: &str) -> Result<()> {
        let Some(at) = self.files.iter().position(|f| f.id == file_id) else {
            bail!("File doesn't exist");
        };
        let file = self.files.remove(at);
        self.trash.push(file);
        Ok(())
    }

    pub fn restore_file(&mut self, file_id: &str) -> Result<()> {
        let Some(at) = self.trash.iter().position(|f| f.id == file_id) else {
            bail!("File isn't in the trash");
        };
        let file = self.trash.remove(at);
        self.files.push(file);
        Ok(())
    }

    pub fn delete_file(&mut self, file_id: &str) -> Result<()> {
        let url = if let Some(at) = self.files.iter().position(|f| f.id == file_id) {
            self.files.remove(at).url
        } else if let Some(at) = self.trash.iter().position(|f| f.id == file_id) {
            self.trash.remove(at).url
        } else {
            bail!("File doesn't exist");
        };
        self.drop_blob_if_unreferenced(&url);
        Ok(())
    }

    // duplicates made by extraction share their original's url
    fn drop_blob_if_unreferenced(&mut self, url: &str) {
        let referenced = self
            .files
            .iter()
            .chain(self.trash.iter())
            .any(|f| f.url == url);
        if !referenced {
            self.blobs.remove(url);
        }
    }
}

impl VaultStore for MemStore {
    fn folders(&self) -> Result<Vec<FolderRecord>> {
        Ok(self.folders.clone())
    }

    fn files(&self) -> Result<Vec<FileRecord>> {
        Ok(self.files.clone())
    }

    fn fetch(&self, file_id: &str) -> Result<Option<SourceBytes>> {
        let Some(file) = self.files.iter().find(|f| f.id == file_id) else {
            return Ok(None);
        };
        let Some(bytes) = self.blobs.get(&file.url) else {
            return Ok(None);
        };
        Ok(Some(SourceBytes {
            bytes: bytes.clone(),
            modified_ms: file.last_modified,
        }))
    }

    fn mint_token(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}", now_ms(), self.seq)
    }

    fn put_blob(&mut self, bytes: Vec<u8>) -> Result<String> {
        let url = format!("blob:{}", self.mint_token());
        self.blobs.insert(url.clone(), bytes);
        Ok(url)
    }

    fn insert_file(&mut self, file: FileRecord) -> Result<()> {
        self.files.push(file);
        Ok(())
    }

    fn insert_batch(&mut self, folders: &[FolderRecord], files: &[FileRecord]) -> Result<()> {
        self.folders.extend_from_slice(folders);
        self.files.extend_from_slice(files);
        Ok(())
    }

    fn update_file(&mut self, file: FileRecord) -> Result<()> {
        let Some(old) = self.files.iter_mut().find(|f| f.id == file.id) else {
            bail!("File doesn't exist");
        };
        let old_url = std::mem::replace(old, file).url;
        self.drop_blob_if_unreferenced(&old_url);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultTree {
    pub roots: Vec<VaultDir>,
    pub loose_files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDir {
    pub folder: FolderRecord,
    pub dirs: Vec<VaultDir>,
    pub files: Vec<FileRecord>,
}

impl VaultTree {
    pub fn assemble(folders: &[FolderRecord], files: &[FileRecord]) -> Self {
        Self {
            roots: folders
                .iter()
                .filter(|f| f.parent_id.is_none())
                .map(|f| VaultDir::assemble_dir(folders, files, f.clone()))
                .collect(),
            loose_files: files
                .iter()
                .filter(|f| f.folder_id.is_none())
                .cloned()
                .collect(),
        }
    }
}

impl VaultDir {
    fn assemble_dir(folders: &[FolderRecord], files: &[FileRecord], folder: FolderRecord) -> Self {
        Self {
            dirs: folders
                .iter()
                .filter(|f| f.parent_id.as_deref() == Some(folder.id.as_str()))
                .map(|f| Self::assemble_dir(folders, files, f.clone()))
                .collect(),
            files: files
                .iter()
                .filter(|f| f.folder_id.as_deref() == Some(folder.id.as_str()))
                .cloned()
                .collect(),
            folder,
        }
    }
}
