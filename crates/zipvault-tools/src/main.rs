use clap::{arg, Arg, ArgMatches, Command, ValueEnum};
use colorize::AnsiColor;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    io::{stdout, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use zipvault::{
    ops,
    reader::read_central_directory,
    store::{MemStore, Snapshot, VaultDir, VaultStore, VaultTree},
    FileRecord, FolderRecord,
};

fn cli() -> Command {
    Command::new("zipvault-tools")
        .about("Tools for creating and inspecting file vaults and their ZIP archives")
        .subcommand_required(true)
        .allow_external_subcommands(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("init")
                .about("Create an empty vault")
                .arg(arg!(-w --overwrite))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("import")
                .about("Import a directory tree into the vault")
                .arg(arg!(source: <SOURCE>))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("tree")
                .about("Display the vault's folder tree")
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty))
                .arg(arg!(-n --noids))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("ls")
                .about("List every file in the vault")
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("compress")
                .about("Pack a folder's subtree into a stored ZIP archive record")
                .arg(arg!(folder: <FOLDER>))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("download")
                .about("Rebuild a file's bytes and write them out")
                .arg(arg!(file: <FILE>))
                .arg(arg!(-o --out [OUT]))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("extract")
                .about("Expand an archive record into folders and files")
                .arg(arg!(file: <FILE>))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("entries")
                .about("Print an archive record's entry metadata")
                .arg(arg!(file: <FILE>))
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("peek")
                .about("List an archive's central directory from its actual bytes")
                .arg(arg!(file: <FILE>))
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Cross-check an archive's bytes against its entry metadata")
                .arg(arg!(file: <FILE>))
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("rm")
                .about("Move a file to the trash, or delete it for good")
                .arg(arg!(file: <FILE>))
                .arg(arg!(--hard))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
        .subcommand(
            Command::new("restore")
                .about("Move a file out of the trash")
                .arg(arg!(name: <NAME>))
                .arg(arg!(--vault [VAULT]))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .short('f')
                        .value_parser(clap::value_parser!(SnapFormat)),
                ),
        )
}

pub fn main() {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("init", sub_matches)) => {
            let (path, format) = vault_location(sub_matches);
            if path.exists() && !sub_matches.get_flag("overwrite") {
                eprintln!(
                    "{}",
                    "Vault already exists, pass --overwrite to replace it"
                        .to_string()
                        .red()
                );
                return;
            }
            save_vault(&MemStore::new(), &path, format);
            println!("Created empty vault at {}", path.display());
        }
        Some(("import", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let source = sub_matches
                .get_one::<String>("source")
                .expect("Couldn't get source from args")
                .clone();
            let source_path =
                std::fs::canonicalize(&source).expect("Couldn't canonicalize source path");
            let root_name = source_path
                .file_name()
                .expect("Couldn't get source dir name")
                .to_string_lossy()
                .to_string();

            let multi_progress = MultiProgress::new();
            let scan_spinner = multi_progress.add(ProgressBar::new_spinner());
            let mut total_bytes = 0;
            let mut dirs: Vec<PathBuf> = Vec::new();
            let mut file_jobs: Vec<(PathBuf, PathBuf)> = Vec::new();
            for entry in walkdir::WalkDir::new(&source_path) {
                let Ok(entry) = entry else {
                    continue;
                };
                scan_spinner.inc(1);
                let rel = entry
                    .path()
                    .strip_prefix(&source_path)
                    .expect("Couldn't relativize path")
                    .to_path_buf();
                if rel.as_os_str().is_empty() {
                    continue;
                }
                if entry.file_type().is_dir() {
                    dirs.push(rel);
                } else {
                    total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    file_jobs.push((entry.path().to_path_buf(), rel));
                }
            }
            scan_spinner.finish();

            // walkdir yields parents before their contents
            let root_id = store.create_folder(&root_name, None);
            let mut folder_ids: HashMap<PathBuf, String> = HashMap::new();
            folder_ids.insert(PathBuf::new(), root_id);
            for rel in &dirs {
                let parent = rel.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                let parent_id = folder_ids
                    .get(&parent)
                    .expect("Couldn't resolve parent folder")
                    .clone();
                let name = rel
                    .file_name()
                    .expect("Couldn't get folder name")
                    .to_string_lossy()
                    .to_string();
                let id = store.create_folder(&name, Some(parent_id));
                folder_ids.insert(rel.clone(), id);
            }

            let entry_progress_bar = multi_progress.add(ProgressBar::new(file_jobs.len() as u64));
            let data_progress_bar = multi_progress.add(ProgressBar::new(total_bytes)
                .with_style(ProgressStyle::with_template(
                    "[{elapsed_precise}] [{eta}] {wide_bar} {bytes}/{total_bytes} ({percent_precise}%)"
                ).unwrap()));

            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            let pool = threadpool::ThreadPool::new(workers);
            let (tx, rx) = flume::unbounded();
            for (abs, rel) in file_jobs {
                let tx = tx.clone();
                pool.execute(move || {
                    let modified = std::fs::metadata(&abs)
                        .and_then(|m| m.modified())
                        .map(|t| {
                            t.duration_since(UNIX_EPOCH)
                                .map(|d| d.as_millis() as i64)
                                .unwrap_or(0)
                        })
                        .unwrap_or(0);
                    let bytes = std::fs::read(&abs);
                    tx.send((rel, modified, bytes))
                        .expect("Couldn't send read result");
                });
            }
            drop(tx);

            for (rel, modified, bytes) in rx.iter() {
                let bytes = bytes.expect("Couldn't read file");
                let parent = rel.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                let folder_id = folder_ids
                    .get(&parent)
                    .expect("Couldn't resolve parent folder")
                    .clone();
                let name = rel
                    .file_name()
                    .expect("Couldn't get file name")
                    .to_string_lossy()
                    .to_string();
                entry_progress_bar.inc(1);
                data_progress_bar.inc(bytes.len() as u64);
                entry_progress_bar.println(rel.display().to_string());
                store.add_file(
                    &name,
                    "application/octet-stream",
                    Some(folder_id),
                    modified,
                    bytes,
                );
            }
            entry_progress_bar.finish();
            data_progress_bar.finish();
            save_vault(&store, &path, format);
        }
        Some(("tree", sub_matches)) => {
            let (store, path, _) = open_vault(sub_matches);
            let tree = VaultTree::assemble(
                &store.folders().expect("Couldn't read folders"),
                &store.files().expect("Couldn't read files"),
            );
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &tree)
                        .expect("Couldn't send tree");
                } else {
                    serde_json::to_writer(stdout().lock(), &tree).expect("Couldn't send tree");
                }
                println!();
            } else {
                println!("{}", path.display().to_string().blue().bold());
                print_level(
                    &tree.loose_files,
                    &tree.roots,
                    &mut BTreeSet::new(),
                    0,
                    !sub_matches.get_flag("noids"),
                );
            }
        }
        Some(("ls", sub_matches)) => {
            let (store, _, _) = open_vault(sub_matches);
            let folders = store.folders().expect("Couldn't read folders");
            let files = store.files().expect("Couldn't read files");
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &files)
                        .expect("Couldn't send files");
                } else {
                    serde_json::to_writer(stdout().lock(), &files).expect("Couldn't send files");
                }
                println!();
            } else {
                for file in &files {
                    println!("{}", record_path(&folders, file));
                }
                if !store.trashed().is_empty() {
                    println!(
                        "{}",
                        AnsiColor::redb(format!("Trash: {} file(s)", store.trashed().len()))
                    );
                }
            }
        }
        Some(("compress", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let folder_path = sub_matches
                .get_one::<String>("folder")
                .expect("Couldn't get folder from args")
                .clone();
            let folder = store
                .folder_by_path(&folder_path)
                .expect("Folder not found in the vault")
                .clone();
            let created =
                ops::compress_folder(&mut store, &folder.id).expect("Couldn't compress folder");
            match created {
                Some(id) => {
                    println!(
                        "Created {} {}",
                        format!("{}.zip", folder.name),
                        format!("[{id}]").red().bold()
                    );
                    save_vault(&store, &path, format);
                }
                None => println!("Nothing to compress"),
            }
        }
        Some(("download", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let file_path = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let file = store
                .file_by_path(&file_path)
                .expect("File not found in the vault")
                .clone();
            let bytes = ops::rebuild_archive(&mut store, &file.id).expect("Couldn't rebuild file");
            let out = sub_matches
                .get_one::<String>("out")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&file.name));
            std::fs::write(&out, &bytes).expect("Couldn't write output file");
            println!("Wrote {} ({} bytes)", out.display(), bytes.len());
            save_vault(&store, &path, format);
        }
        Some(("extract", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let file_path = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let file = store
                .file_by_path(&file_path)
                .expect("File not found in the vault")
                .clone();
            if !file.has_archive_entries() {
                eprintln!("{}", "File has no archive entries".to_string().red());
                return;
            }
            let expansion =
                ops::extract_archive(&mut store, &file.id).expect("Couldn't extract archive");
            println!(
                "Created {} with {} folder(s) and {} file(s)",
                expansion.folders[0].name.clone().blue().bold(),
                expansion.folders.len(),
                expansion.files.len()
            );
            save_vault(&store, &path, format);
        }
        Some(("entries", sub_matches)) => {
            let (store, _, _) = open_vault(sub_matches);
            let file_path = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let file = store
                .file_by_path(&file_path)
                .expect("File not found in the vault");
            let entries = file.archive_entries.clone().unwrap_or_default();
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &entries)
                        .expect("Couldn't encode entries");
                } else {
                    serde_json::to_writer(stdout().lock(), &entries)
                        .expect("Couldn't encode entries");
                }
            } else {
                serde_yaml::to_writer(stdout().lock(), &entries).expect("Couldn't encode entries");
            }
            println!();
        }
        Some(("peek", sub_matches)) => {
            let target = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let (path, format) = vault_location(sub_matches);
            let bytes = if path.exists() {
                let store = load_vault(&path, format);
                match store.file_by_path(&target) {
                    Some(file) => {
                        store
                            .fetch(&file.id)
                            .expect("Couldn't fetch file")
                            .expect("File data is missing")
                            .bytes
                    }
                    None => std::fs::read(&target).expect("Couldn't read the file"),
                }
            } else {
                std::fs::read(&target).expect("Couldn't read the file")
            };
            let listed = read_central_directory(&bytes).expect("Couldn't parse the archive");
            let listed: Vec<PeekEntry> = listed
                .iter()
                .map(|e| PeekEntry {
                    name: e.name.clone(),
                    size: e.uncompressed_size,
                    crc32: format!("{:08X}", e.crc32),
                    method: e.method,
                    offset: e.local_offset,
                })
                .collect();
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &listed)
                        .expect("Couldn't encode entries");
                } else {
                    serde_json::to_writer(stdout().lock(), &listed)
                        .expect("Couldn't encode entries");
                }
                println!();
            } else {
                for entry in &listed {
                    println!("{:>10}  {}  {}", entry.size, entry.crc32, entry.name);
                }
            }
        }
        Some(("verify", sub_matches)) => {
            let (store, _, _) = open_vault(sub_matches);
            let file_path = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let file = store
                .file_by_path(&file_path)
                .expect("File not found in the vault");
            let report = ops::verify_archive(&store, &file.id).expect("Couldn't verify archive");
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &report)
                        .expect("Couldn't encode report");
                } else {
                    serde_json::to_writer(stdout().lock(), &report)
                        .expect("Couldn't encode report");
                }
                println!();
            } else {
                for name in &report.matched {
                    println!("ok        {name}");
                }
                for m in &report.mismatched {
                    println!(
                        "{}",
                        format!(
                            "mismatch  {} (crc {:08X} != {:08X}, size {} != {})",
                            m.name, m.actual_crc, m.expected_crc, m.actual_size, m.expected_size
                        )
                        .red()
                        .bold()
                    );
                }
                for name in &report.missing_from_bytes {
                    println!("{}", format!("missing   {name}").red().bold());
                }
                for name in &report.extra_in_bytes {
                    println!("{}", format!("extra     {name}").red());
                }
                for name in &report.unverifiable {
                    println!("{}", format!("unknown   {name}").yellow());
                }
                if report.is_clean() {
                    println!("Archive verifies clean");
                }
            }
        }
        Some(("rm", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let file_path = sub_matches
                .get_one::<String>("file")
                .expect("Couldn't get file from args")
                .clone();
            let file = store
                .file_by_path(&file_path)
                .expect("File not found in the vault")
                .clone();
            if sub_matches.get_flag("hard") {
                store.delete_file(&file.id).expect("Couldn't delete file");
            } else {
                store.trash_file(&file.id).expect("Couldn't trash file");
            }
            save_vault(&store, &path, format);
        }
        Some(("restore", sub_matches)) => {
            let (mut store, path, format) = open_vault(sub_matches);
            let name = sub_matches
                .get_one::<String>("name")
                .expect("Couldn't get name from args")
                .clone();
            let id = store
                .trashed()
                .iter()
                .find(|f| f.name == name)
                .expect("File isn't in the trash")
                .id
                .clone();
            store.restore_file(&id).expect("Couldn't restore file");
            save_vault(&store, &path, format);
        }
        _ => unreachable!(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct PeekEntry {
    name: String,
    size: u32,
    crc32: String,
    method: u16,
    offset: u32,
}

fn print_level(
    files: &[FileRecord],
    dirs: &[VaultDir],
    last_depths: &mut BTreeSet<usize>,
    depth: usize,
    ids: bool,
) {
    let mut len = files.len() + dirs.len();

    for file in files.iter() {
        len -= 1;
        print!("{} {}", tree_indent(depth, last_depths, len == 0), file.name);
        if ids {
            println!(" {}", format!("[{}]", file.id).red().bold());
        } else {
            println!();
        }
    }
    for dir in dirs.iter() {
        len -= 1;
        print!(
            "{} {}",
            tree_indent(depth, last_depths, len == 0),
            dir.folder.name.clone().bold().blue()
        );
        if ids {
            println!(" {}", format!("[{}]", dir.folder.id).red().bold());
        } else {
            println!();
        }
        if len != 0 {
            last_depths.insert(depth);
        }
        print_level(&dir.files, &dir.dirs, last_depths, depth + 1, ids);
        if len != 0 {
            last_depths.remove(&depth);
        }
    }
}

fn tree_indent(depth: usize, last_depths: &BTreeSet<usize>, is_last: bool) -> String {
    let mut indent = String::new();
    for i in 0..depth {
        indent.push_str(if last_depths.contains(&i) {
            "│   "
        } else {
            "    "
        });
    }
    indent.push_str(if is_last { "└──" } else { "├──" });
    indent
}

fn record_path(folders: &[FolderRecord], file: &FileRecord) -> String {
    let mut segs = vec![file.name.clone()];
    let mut cur = file.folder_id.clone();
    while let Some(id) = cur {
        let Some(folder) = folders.iter().find(|f| f.id == id) else {
            break;
        };
        segs.push(folder.name.clone());
        cur = folder.parent_id.clone();
    }
    segs.reverse();
    segs.join("/")
}

fn open_vault(sub_matches: &ArgMatches) -> (MemStore, PathBuf, SnapFormat) {
    let (path, format) = vault_location(sub_matches);
    (load_vault(&path, format), path, format)
}

fn load_vault(path: &Path, format: SnapFormat) -> MemStore {
    let data = std::fs::read(path).expect("Couldn't read the vault file");
    let snapshot: Snapshot = match format {
        SnapFormat::Bitcode => bitcode::decode(&data).expect("Couldn't decode the vault file"),
        SnapFormat::Json => serde_json::from_slice(&data).expect("Couldn't decode the vault file"),
    };
    MemStore::from_snapshot(snapshot)
}

fn save_vault(store: &MemStore, path: &Path, format: SnapFormat) {
    let snapshot = store.snapshot();
    let mut f = File::create(path).expect("Couldn't create the vault file");
    match format {
        SnapFormat::Bitcode => f
            .write_all(&bitcode::encode(&snapshot))
            .expect("Couldn't write the vault file"),
        SnapFormat::Json => {
            serde_json::to_writer(&mut f, &snapshot).expect("Couldn't write the vault file")
        }
    }
}

fn vault_location(matches: &ArgMatches) -> (PathBuf, SnapFormat) {
    let path = matches
        .get_one::<String>("vault")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vault.zv"));
    let format = matches
        .get_one::<SnapFormat>("format")
        .map(|f| *f)
        .unwrap_or_default();
    (path, format)
}

#[derive(Debug, ValueEnum, Clone, Copy, Default)]
#[clap(rename_all = "snake_case")]
pub enum SnapFormat {
    #[default]
    Bitcode,
    Json,
}
