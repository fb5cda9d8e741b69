pub mod checksum;
pub mod copy;
pub mod filter;
pub mod scheduler;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use chrono::{DateTime, Utc};

use crate::cache::{read_sync_roots, FingerprintCache, SyncRoot};
use crate::cli::args::{
    DeleteArgs, DownloadArgs, InfoArgs, ListArgs, ListSyncArgs, MkdirArgs, UpdateArgs, UploadArgs,
};
use crate::config::types::{AppConfig, ConflictResolution};
use crate::error::DriveError;
use crate::progress::bar::{create_file_progress, create_sync_progress};
use crate::remote::directory::DirectoryStore;
use crate::remote::{NewEntry, RemoteEntry, RemoteStore, ROOT_ID};
use crate::sync::compare::ChangeComparer;
use crate::sync::diff::{DiffOptions, Direction, TreeDiffer};
use crate::sync::engine::SyncEngine;
use crate::sync::plan::SyncReport;
use crate::sync::run_until_interrupted;
use crate::sync::tree::{EntryTree, FileEntry};

use self::copy::{download_file, stream_to, upload_new, upload_stream, upload_update};
use self::filter::IgnoreFilter;

fn open_store(config: &AppConfig, chunk_size: u64) -> Result<Arc<DirectoryStore>, DriveError> {
    Ok(Arc::new(DirectoryStore::open(&config.store_dir, chunk_size)?))
}

fn parents_or_root(parents: Vec<String>) -> Vec<String> {
    if parents.is_empty() {
        vec![ROOT_ID.to_string()]
    } else {
        parents
    }
}

/// Refuse one-shot uploads into a folder that `sync` manages, or below one.
///
/// The drive root is exempt since every sync directory lives under it.
fn ensure_not_synced(
    store: &dyn RemoteStore,
    config: &AppConfig,
    parents: &[String],
) -> Result<(), DriveError> {
    let roots = read_sync_roots(&config.cache_path)?;
    if roots.is_empty() {
        return Ok(());
    }
    for parent in parents {
        let mut seen = HashSet::new();
        let mut pending = vec![parent.clone()];
        while let Some(id) = pending.pop() {
            if id == ROOT_ID || !seen.insert(id.clone()) {
                continue;
            }
            if roots.contains_key(&id) {
                return Err(DriveError::SyncDirectory { id: parent.clone() });
            }
            pending.extend(store.get(&id)?.parents);
        }
    }
    Ok(())
}

/// Average throughput, for the one-line transfer summary.
fn rate(bytes: u64, elapsed: Duration) -> ByteSize {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        ByteSize((bytes as f64 / secs) as u64)
    } else {
        ByteSize(bytes)
    }
}

/// Execute `drivesync upload`.
pub fn execute_upload(args: UploadArgs, config: &AppConfig) -> Result<(), DriveError> {
    let chunk_size = config.chunk_size_or(args.chunksize)?;
    let concurrency = config.concurrency_or(args.concurrency)?;
    if args.recursive && args.delete {
        return Err(DriveError::Config(
            "--delete cannot be combined with --recursive".to_string(),
        ));
    }
    if args.from_stdin() {
        return upload_stdin(args, config, chunk_size);
    }

    let source = &args.path;
    let metadata = std::fs::metadata(source).map_err(|e| DriveError::from_io(e, source))?;
    let name = match args.name {
        Some(name) => name,
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DriveError::Config(format!("Cannot derive a name from '{}'", source.display()))
            })?,
    };
    if metadata.is_dir() && !args.recursive {
        return Err(DriveError::IsDirectory {
            name,
            verb: "upload",
        });
    }

    let store = open_store(config, chunk_size)?;
    let parents = parents_or_root(args.parents);
    ensure_not_synced(store.as_ref(), config, &parents)?;

    if metadata.is_dir() {
        let folder = store.create(&NewEntry::folder(&name, parents), None)?;
        tracing::info!(id = %folder.id, name = %name, "Created remote folder");
        let report = upload_tree(store, config, source, &folder.id, concurrency)?;
        println!("{}", folder.id);
        return finish_tree(report);
    }

    let entry = NewEntry::file(
        &name,
        parents,
        Some(metadata.modified()?.into()),
    );
    let progress = create_file_progress(metadata.len(), !config.show_progress);
    let started = Instant::now();
    let uploaded = upload_new(store.as_ref(), source, &entry, &progress)?;
    progress.finish_and_clear();
    store.flush()?;

    println!(
        "Uploaded {} at {}/s, total {}",
        uploaded.entry.id,
        rate(uploaded.bytes, started.elapsed()),
        ByteSize(uploaded.bytes)
    );

    if args.delete {
        std::fs::remove_file(source).map_err(|e| DriveError::from_io(e, source))?;
        tracing::info!(path = %source.display(), "Deleted local file after upload");
    }
    Ok(())
}

/// `drivesync upload -`: store everything read from stdin as a new file.
fn upload_stdin(args: UploadArgs, config: &AppConfig, chunk_size: u64) -> Result<(), DriveError> {
    if args.recursive || args.delete {
        return Err(DriveError::Config(
            "--recursive and --delete need a local path, not stdin".to_string(),
        ));
    }
    let name = args.name.ok_or_else(|| {
        DriveError::Config("--name is required when uploading from stdin".to_string())
    })?;

    let store = open_store(config, chunk_size)?;
    let parents = parents_or_root(args.parents);
    ensure_not_synced(store.as_ref(), config, &parents)?;

    let entry = NewEntry::file(&name, parents, None);
    let progress = create_sync_progress(!config.show_progress);
    progress.set_message(name);
    let started = Instant::now();
    let uploaded = upload_stream(store.as_ref(), std::io::stdin().lock(), &entry, &progress)?;
    progress.finish_and_clear();
    store.flush()?;

    println!(
        "Uploaded {} at {}/s, total {}",
        uploaded.entry.id,
        rate(uploaded.bytes, started.elapsed()),
        ByteSize(uploaded.bytes)
    );
    Ok(())
}

/// Execute `drivesync update`: replace the content of a remote file.
pub fn execute_update(args: UpdateArgs, config: &AppConfig) -> Result<(), DriveError> {
    let chunk_size = config.chunk_size_or(args.chunksize)?;
    let source = &args.path;
    let metadata = std::fs::metadata(source).map_err(|e| DriveError::from_io(e, source))?;
    if metadata.is_dir() {
        return Err(DriveError::Config(format!(
            "'{}' is a directory, only files can be updated",
            source.display()
        )));
    }

    let store = open_store(config, chunk_size)?;
    let progress = create_file_progress(metadata.len(), !config.show_progress);
    let started = Instant::now();
    let uploaded = upload_update(
        store.as_ref(),
        source,
        &args.file_id,
        Some(metadata.modified()?.into()),
        &progress,
    )?;
    progress.finish_and_clear();
    store.flush()?;

    println!(
        "Updated {} at {}/s, total {}",
        uploaded.entry.id,
        rate(uploaded.bytes, started.elapsed()),
        ByteSize(uploaded.bytes)
    );
    Ok(())
}

/// Upload the contents of `source` into the freshly created folder `folder_id`.
fn upload_tree(
    store: Arc<DirectoryStore>,
    config: &AppConfig,
    source: &Path,
    folder_id: &str,
    concurrency: usize,
) -> Result<SyncReport, DriveError> {
    let root = absolute(source)?;
    let filter = IgnoreFilter::for_root(&root, &config.exclude)?;
    let local = EntryTree::scan_local(&root, &filter)?;
    let cache = Arc::new(FingerprintCache::load(&config.cache_path)?);
    let differ = TreeDiffer::new(
        local,
        EntryTree::empty(),
        folder_id,
        ChangeComparer::new(cache.clone(), &root),
        DiffOptions {
            direction: Direction::Upload,
            delete_extraneous: false,
            resolution: ConflictResolution::NoResolution,
        },
    );
    let show_progress = config.show_progress;
    run_until_interrupted(|cancel| async move {
        let mut engine = SyncEngine::new(store, cache, cancel);
        engine
            .execute(differ, &root, concurrency, show_progress)
            .await
    })
}

/// Execute `drivesync download`.
pub fn execute_download(args: DownloadArgs, config: &AppConfig) -> Result<(), DriveError> {
    let concurrency = config.concurrency_or(args.concurrency)?;
    if args.recursive && args.delete {
        return Err(DriveError::Config(
            "--delete cannot be combined with --recursive".to_string(),
        ));
    }

    let store = open_store(config, config.chunk_size)?;
    let entry = store.get(&args.file_id)?;
    if entry.is_dir && !args.recursive {
        return Err(DriveError::IsDirectory {
            name: entry.name,
            verb: "download",
        });
    }

    if args.stdout {
        if entry.is_dir {
            return Err(DriveError::Config(
                "--stdout can only stream a single file".to_string(),
            ));
        }
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let bytes = stream_to(store.as_ref(), &entry.id, &mut out)?;
        tracing::debug!(id = %entry.id, bytes, "Streamed to stdout");
        return delete_after_download(store.as_ref(), &entry, args.delete);
    }

    let dest = absolute(&args.path)?.join(&entry.name);
    if dest.exists() && !args.force {
        return Err(DriveError::AlreadyExists { path: dest });
    }

    if entry.is_dir {
        std::fs::create_dir_all(&dest).map_err(|e| DriveError::from_io(e, &dest))?;
        let report = download_tree(store, config, &entry.id, &dest, concurrency)?;
        return finish_tree(report);
    }

    let cache = FingerprintCache::load(&config.cache_path)?;
    let progress = create_file_progress(entry.size, !config.show_progress);
    let started = Instant::now();
    let downloaded = download_file(
        store.as_ref(),
        &entry.id,
        &dest,
        Some(entry.modified),
        &progress,
    )?;
    progress.finish_and_clear();

    let metadata = std::fs::metadata(&dest).map_err(|e| DriveError::from_io(e, &dest))?;
    cache.store(&dest, metadata.len(), metadata.modified()?, &downloaded.hash);
    cache.mark_synced(&dest, &downloaded.hash, &entry.id);
    cache.save()?;

    eprintln!(
        "Downloaded {} at {}/s, total {}",
        dest.display(),
        rate(downloaded.bytes, started.elapsed()),
        ByteSize(downloaded.bytes)
    );
    delete_after_download(store.as_ref(), &entry, args.delete)
}

fn delete_after_download(
    store: &dyn RemoteStore,
    entry: &RemoteEntry,
    delete: bool,
) -> Result<(), DriveError> {
    if delete {
        store.delete(&entry.id)?;
        tracing::info!(id = %entry.id, "Deleted remote file after download");
    }
    Ok(())
}

/// Download the subtree of folder `folder_id` into `dest`.
fn download_tree(
    store: Arc<DirectoryStore>,
    config: &AppConfig,
    folder_id: &str,
    dest: &Path,
    concurrency: usize,
) -> Result<SyncReport, DriveError> {
    let filter = IgnoreFilter::new(&config.exclude)?;
    let remote = EntryTree::scan_remote(store.as_ref(), folder_id, &filter)?;
    let cache = Arc::new(FingerprintCache::load(&config.cache_path)?);
    let differ = TreeDiffer::new(
        EntryTree::empty(),
        remote,
        folder_id,
        ChangeComparer::new(cache.clone(), dest),
        DiffOptions {
            direction: Direction::Download,
            delete_extraneous: false,
            resolution: ConflictResolution::NoResolution,
        },
    );
    let root = dest.to_path_buf();
    let show_progress = config.show_progress;
    run_until_interrupted(|cancel| async move {
        let mut engine = SyncEngine::new(store, cache, cancel);
        engine
            .execute(differ, &root, concurrency, show_progress)
            .await
    })
}

/// Print the summary of a recursive transfer and turn failures into an error.
fn finish_tree(report: SyncReport) -> Result<(), DriveError> {
    report.print_summary();
    if let Some(fatal) = report.fatal {
        return Err(fatal);
    }
    if report.failed() > 0 {
        return Err(DriveError::TransfersFailed {
            count: report.failed(),
        });
    }
    Ok(())
}

/// Execute `drivesync mkdir`: prints the new folder's id.
pub fn execute_mkdir(args: MkdirArgs, config: &AppConfig) -> Result<(), DriveError> {
    let store = open_store(config, config.chunk_size)?;
    let folder = store.create(
        &NewEntry::folder(&args.name, parents_or_root(args.parents)),
        None,
    )?;
    store.flush()?;
    tracing::debug!(id = %folder.id, name = %folder.name, "Created folder");
    println!("{}", folder.id);
    Ok(())
}

/// Execute `drivesync list`: one tab-separated line per child on stdout.
pub fn execute_list(args: ListArgs, config: &AppConfig) -> Result<(), DriveError> {
    let store = open_store(config, config.chunk_size)?;
    let parent = args.parent.unwrap_or_else(|| ROOT_ID.to_string());
    let mut children = store.list(&parent)?;
    children.sort_by(|a, b| (!a.is_dir, &a.name).cmp(&(!b.is_dir, &b.name)));
    for entry in children {
        println!("{}", list_line(&entry));
    }
    Ok(())
}

fn list_line(entry: &RemoteEntry) -> String {
    tab_line(&entry.id, entry.is_dir, entry.size, entry.modified, &entry.name)
}

fn tab_line(id: &str, is_dir: bool, size: u64, modified: DateTime<Utc>, name: &str) -> String {
    let kind = if is_dir { "dir" } else { "file" };
    format!(
        "{}\t{}\t{}\t{}\t{}",
        id,
        kind,
        ByteSize(size),
        modified.format("%Y-%m-%d %H:%M:%S"),
        name
    )
}

/// Execute `drivesync info`: one `Key: value` line per field.
pub fn execute_info(args: InfoArgs, config: &AppConfig) -> Result<(), DriveError> {
    let store = open_store(config, config.chunk_size)?;
    let entry = store.get(&args.file_id)?;
    let path = remote_path(store.as_ref(), &entry)?;
    let roots = read_sync_roots(&config.cache_path)?;
    for (key, value) in info_fields(&entry, &path, args.bytes, roots.get(&entry.id)) {
        println!("{}: {}", key, value);
    }
    Ok(())
}

fn info_fields(
    entry: &RemoteEntry,
    path: &str,
    in_bytes: bool,
    sync_root: Option<&SyncRoot>,
) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("Id", entry.id.clone()),
        ("Name", entry.name.clone()),
        ("Path", path.to_string()),
        ("Kind", if entry.is_dir { "folder" } else { "file" }.to_string()),
    ];
    if !entry.is_dir {
        let size = if in_bytes {
            entry.size.to_string()
        } else {
            ByteSize(entry.size).to_string()
        };
        fields.push(("Size", size));
        if let Some(hash) = &entry.content_hash {
            fields.push(("Hash", hash.clone()));
        }
    }
    fields.push((
        "Modified",
        entry.modified.format("%Y-%m-%d %H:%M:%S").to_string(),
    ));
    if !entry.parents.is_empty() {
        fields.push(("Parents", entry.parents.join(", ")));
    }
    if let Some(root) = sync_root {
        fields.push(("Synced with", root.local.clone()));
    }
    fields
}

/// Absolute path of `entry` in the drive, following first parents.
fn remote_path(store: &dyn RemoteStore, entry: &RemoteEntry) -> Result<String, DriveError> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    let mut current = entry.clone();
    while current.id != ROOT_ID && seen.insert(current.id.clone()) {
        names.push(current.name.clone());
        let Some(parent) = current.parents.first() else {
            break;
        };
        current = store.get(parent)?;
    }
    names.reverse();
    Ok(format!("/{}", names.join("/")))
}

/// Execute `drivesync list-sync`.
///
/// Without an id, prints one line per sync directory: id, name, local path
/// and last sync time. With the id of a sync directory, prints every entry
/// below it in `list` format, with relative paths instead of names.
pub fn execute_list_sync(args: ListSyncArgs, config: &AppConfig) -> Result<(), DriveError> {
    let store = open_store(config, config.chunk_size)?;
    let roots = read_sync_roots(&config.cache_path)?;

    let Some(id) = args.file_id else {
        for (id, root) in &roots {
            let name = match store.get(id) {
                Ok(entry) => entry.name,
                Err(DriveError::RemoteNotFound { .. }) => "(deleted)".to_string(),
                Err(e) => return Err(e),
            };
            println!(
                "{}\t{}\t{}\t{}",
                id,
                name,
                root.local,
                root.synced_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    };

    if !roots.contains_key(&id) {
        return Err(DriveError::Sync(format!("{} is not a sync directory", id)));
    }
    let tree = EntryTree::scan_remote(store.as_ref(), &id, &IgnoreFilter::empty())?;
    let mut entries = Vec::with_capacity(tree.len());
    walk_tree(&tree, "", &mut entries);
    for entry in entries {
        println!(
            "{}",
            tab_line(
                entry.remote_id(),
                entry.is_dir,
                entry.size,
                entry.modified,
                &entry.path
            )
        );
    }
    Ok(())
}

/// Depth-first, each directory followed by its contents.
fn walk_tree<'a>(tree: &'a EntryTree, dir: &str, out: &mut Vec<&'a FileEntry>) {
    for entry in tree.children(dir) {
        out.push(entry);
        if entry.is_dir {
            walk_tree(tree, &entry.path, out);
        }
    }
}

/// Execute `drivesync delete`.
pub fn execute_delete(args: DeleteArgs, config: &AppConfig) -> Result<(), DriveError> {
    let store = open_store(config, config.chunk_size)?;
    let entry = store.get(&args.file_id)?;
    if entry.is_dir && !args.recursive {
        return Err(DriveError::IsDirectory {
            name: entry.name,
            verb: "delete",
        });
    }
    store.delete(&entry.id)?;
    eprintln!("Deleted {} ({})", entry.name, entry.id);
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, DriveError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
