pub mod crc32;
pub mod expand;
pub mod ops;
pub mod reader;
pub mod store;
pub mod zip;

use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Decode, Encode, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub file_id: String,
    /// folder names from the archive root down, empty = root
    pub path: Vec<String>,
}

#[derive(Debug, PartialEq, Decode, Encode, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub selected: bool,
    pub favorite: bool,
}

#[derive(Debug, PartialEq, Decode, Encode, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub last_modified: i64,
    pub folder_id: Option<String>,
    pub selected: bool,
    pub favorite: bool,
    pub created_at: i64,
    pub opened_at: Option<i64>,
    pub name_modified_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_of_folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_entries: Option<Vec<ArchiveEntry>>,
}

impl FileRecord {
    pub fn is_zip(&self) -> bool {
        self.kind == "application/zip" || self.name.to_lowercase().ends_with(".zip")
    }

    pub fn has_archive_entries(&self) -> bool {
        self.archive_entries
            .as_ref()
            .is_some_and(|entries| !entries.is_empty())
    }
}
