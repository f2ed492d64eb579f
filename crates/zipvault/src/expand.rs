use std::collections::HashMap;

use crate::{FileRecord, FolderRecord};

#[derive(Debug, Clone)]
pub struct Expansion {
    pub root_folder_id: String,
    /// root first, then nested folders in creation order
    pub folders: Vec<FolderRecord>,
    pub files: Vec<FileRecord>,
}

/// Rebuilds an archive's folder/file tree from its entry metadata alone.
/// Storage references are duplicated, bytes are never copied or parsed.
pub fn expand(
    archive: &FileRecord,
    folders: &[FolderRecord],
    files: &[FileRecord],
    now_ms: i64,
    mut mint: impl FnMut() -> String,
) -> Expansion {
    let parent_id = archive.folder_id.clone();
    let base = archive_base_name(&archive.name);
    let name = collision_free_name(base, folders, parent_id.as_deref());

    let root_id = format!("fld-{}", mint());
    let mut new_folders = vec![FolderRecord {
        id: root_id.clone(),
        name,
        parent_id,
        selected: false,
        favorite: false,
    }];
    let mut created: HashMap<String, String> = HashMap::new();
    let mut new_files = Vec::new();

    let empty = Vec::new();
    let entries = archive.archive_entries.as_ref().unwrap_or(&empty);
    for entry in entries {
        let Some(orig) = files.iter().find(|f| f.id == entry.file_id) else {
            continue;
        };
        let target = ensure_path(
            &root_id,
            &entry.path,
            &mut created,
            &mut new_folders,
            &mut mint,
        );
        new_files.push(FileRecord {
            id: format!("{}-copy-{}", orig.id, mint()),
            name: orig.name.clone(),
            size: orig.size,
            kind: orig.kind.clone(),
            url: orig.url.clone(),
            last_modified: orig.last_modified,
            folder_id: Some(target),
            selected: false,
            favorite: false,
            created_at: now_ms,
            opened_at: None,
            name_modified_at: None,
            archive_of_folder_id: None,
            archive_entries: None,
        });
    }

    Expansion {
        root_folder_id: root_id,
        folders: new_folders,
        files: new_files,
    }
}

fn archive_base_name(name: &str) -> &str {
    let bytes = name.as_bytes();
    let base = if bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".zip") {
        &name[..name.len() - 4]
    } else {
        name
    };
    if base.is_empty() {
        "Extracted"
    } else {
        base
    }
}

fn collision_free_name(base: &str, folders: &[FolderRecord], parent_id: Option<&str>) -> String {
    let siblings: Vec<String> = folders
        .iter()
        .filter(|f| f.parent_id.as_deref() == parent_id)
        .map(|f| f.name.to_lowercase())
        .collect();
    if !siblings.contains(&base.to_lowercase()) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{base} ({i})");
        if !siblings.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        i += 1;
    }
}

fn ensure_path(
    root_id: &str,
    segments: &[String],
    created: &mut HashMap<String, String>,
    new_folders: &mut Vec<FolderRecord>,
    mint: &mut impl FnMut() -> String,
) -> String {
    let mut parent = root_id.to_string();
    for seg in segments {
        let key = format!("{parent}::{seg}");
        let child = match created.get(&key) {
            Some(id) => id.clone(),
            None => {
                let id = format!("fld-{}", mint());
                new_folders.push(FolderRecord {
                    id: id.clone(),
                    name: seg.clone(),
                    parent_id: Some(parent.clone()),
                    selected: false,
                    favorite: false,
                });
                created.insert(key, id.clone());
                id
            }
        };
        parent = child;
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArchiveEntry;

    fn counter() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("t{n}")
        }
    }

    fn file(id: &str, name: &str, folder_id: Option<&str>) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            name: name.to_string(),
            size: 3,
            kind: "text/plain".to_string(),
            url: format!("blob:{id}"),
            last_modified: 100,
            folder_id: folder_id.map(|s| s.to_string()),
            selected: true,
            favorite: true,
            created_at: 1,
            opened_at: Some(2),
            name_modified_at: Some(3),
            archive_of_folder_id: None,
            archive_entries: None,
        }
    }

    fn archive(name: &str, parent: Option<&str>, entries: Vec<ArchiveEntry>) -> FileRecord {
        let mut record = file("zip1", name, parent);
        record.kind = "application/zip".to_string();
        record.archive_of_folder_id = Some("fld-src".to_string());
        record.archive_entries = Some(entries);
        record
    }

    #[test]
    fn expands_nested_entries() {
        let files = vec![file("f1", "a.txt", None), file("f2", "b.txt", None)];
        let archive = archive(
            "Photos.zip",
            None,
            vec![
                ArchiveEntry {
                    file_id: "f1".to_string(),
                    path: vec![],
                },
                ArchiveEntry {
                    file_id: "f2".to_string(),
                    path: vec!["sub".to_string()],
                },
            ],
        );
        let out = expand(&archive, &[], &files, 999, counter());

        assert_eq!(out.folders.len(), 2);
        assert_eq!(out.folders[0].name, "Photos");
        assert_eq!(out.folders[0].id, out.root_folder_id);
        assert_eq!(out.folders[1].name, "sub");
        assert_eq!(
            out.folders[1].parent_id.as_deref(),
            Some(out.root_folder_id.as_str())
        );

        assert_eq!(out.files.len(), 2);
        assert_eq!(
            out.files[0].folder_id.as_deref(),
            Some(out.root_folder_id.as_str())
        );
        assert_eq!(
            out.files[1].folder_id.as_deref(),
            Some(out.folders[1].id.as_str())
        );
    }

    #[test]
    fn duplicates_share_urls_and_reset_state() {
        let files = vec![file("f1", "a.txt", None)];
        let archive = archive(
            "x.zip",
            None,
            vec![ArchiveEntry {
                file_id: "f1".to_string(),
                path: vec![],
            }],
        );
        let out = expand(&archive, &[], &files, 999, counter());

        let dup = &out.files[0];
        assert_eq!(dup.url, "blob:f1");
        assert!(dup.id.starts_with("f1-copy-"));
        assert_ne!(dup.id, "f1");
        assert!(!dup.selected);
        assert!(!dup.favorite);
        assert_eq!(dup.created_at, 999);
        assert_eq!(dup.last_modified, 100);
        assert_eq!(dup.opened_at, None);
        assert_eq!(dup.name_modified_at, None);
        assert_eq!(dup.archive_of_folder_id, None);
        assert_eq!(dup.archive_entries, None);
    }

    #[test]
    fn shared_path_segments_are_created_once() {
        let files = vec![file("f1", "a.txt", None), file("f2", "b.txt", None)];
        let archive = archive(
            "x.zip",
            None,
            vec![
                ArchiveEntry {
                    file_id: "f1".to_string(),
                    path: vec!["sub".to_string()],
                },
                ArchiveEntry {
                    file_id: "f2".to_string(),
                    path: vec!["sub".to_string()],
                },
            ],
        );
        let out = expand(&archive, &[], &files, 0, counter());
        assert_eq!(out.folders.len(), 2);
        assert_eq!(out.files[0].folder_id, out.files[1].folder_id);
    }

    #[test]
    fn missing_originals_leave_no_trace() {
        let files = vec![file("f1", "a.txt", None)];
        let archive = archive(
            "x.zip",
            None,
            vec![
                ArchiveEntry {
                    file_id: "gone".to_string(),
                    path: vec!["ghost".to_string()],
                },
                ArchiveEntry {
                    file_id: "f1".to_string(),
                    path: vec![],
                },
            ],
        );
        let out = expand(&archive, &[], &files, 0, counter());
        assert_eq!(out.files.len(), 1);
        assert!(!out.folders.iter().any(|f| f.name == "ghost"));
    }

    #[test]
    fn root_name_dodges_existing_siblings() {
        let existing = vec![
            FolderRecord {
                id: "e1".to_string(),
                name: "REPORT".to_string(),
                parent_id: None,
                selected: false,
                favorite: false,
            },
            FolderRecord {
                id: "e2".to_string(),
                name: "report (1)".to_string(),
                parent_id: None,
                selected: false,
                favorite: false,
            },
        ];
        let archive = archive("report.zip", None, vec![]);
        let out = expand(&archive, &existing, &[], 0, counter());
        assert_eq!(out.folders[0].name, "report (2)");
    }

    #[test]
    fn collision_check_is_scoped_to_the_destination() {
        let existing = vec![FolderRecord {
            id: "e1".to_string(),
            name: "report".to_string(),
            parent_id: Some("elsewhere".to_string()),
            selected: false,
            favorite: false,
        }];
        let archive = archive("report.zip", None, vec![]);
        let out = expand(&archive, &existing, &[], 0, counter());
        assert_eq!(out.folders[0].name, "report");
    }

    #[test]
    fn bare_zip_name_falls_back() {
        let archive = archive(".zip", None, vec![]);
        let out = expand(&archive, &[], &[], 0, counter());
        assert_eq!(out.folders[0].name, "Extracted");
    }

    #[test]
    fn missing_sidecar_still_creates_the_root() {
        let mut record = file("zip1", "x.zip", None);
        record.archive_entries = None;
        let out = expand(&record, &[], &[], 0, counter());
        assert_eq!(out.folders.len(), 1);
        assert!(out.files.is_empty());
    }
}
