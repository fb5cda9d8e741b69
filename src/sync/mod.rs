pub mod compare;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod plan;
pub mod tree;

use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::FingerprintCache;
use crate::cli::args::{SyncArgs, SyncDirection};
use crate::config::types::{AppConfig, ConflictResolution};
use crate::error::DriveError;
use crate::remote::directory::DirectoryStore;

use self::diff::{DiffOptions, Direction};
use self::engine::{SyncEngine, SyncOptions};

/// Run `task` on a fresh runtime. Ctrl-C cancels the token it is given.
pub fn run_until_interrupted<F, Fut, T>(task: F) -> Result<T, DriveError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, DriveError>>,
{
    let rt = tokio::runtime::Runtime::new().map_err(|e| DriveError::Io { source: e })?;
    let cancel = CancellationToken::new();
    rt.block_on(async {
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, waiting for in-flight transfers");
                on_interrupt.cancel();
            }
        });
        task(cancel).await
    })
}

/// Entry point for the `drivesync sync` command.
///
/// Validates flags before touching anything, runs the engine, prints the
/// plan or the summary, and turns conflicts and failures into an exit
/// status.
pub fn execute_sync(args: SyncArgs, config: &AppConfig) -> Result<(), DriveError> {
    let resolution =
        ConflictResolution::from_flags(args.keep_local, args.keep_remote, args.keep_largest)?;
    let chunk_size = config.chunk_size_or(args.chunksize)?;
    let concurrency = config.concurrency_or(args.concurrency)?;

    let (direction, local_root, remote_root_id) = match args.direction {
        SyncDirection::Upload { path, file_id } => (Direction::Upload, path, file_id),
        SyncDirection::Download { file_id, path } => (Direction::Download, path, file_id),
    };
    if direction == Direction::Download && !args.dry_run && !local_root.exists() {
        std::fs::create_dir_all(&local_root)
            .map_err(|e| DriveError::from_io(e, &local_root))?;
    }

    let mut exclude = config.exclude.clone();
    exclude.extend(args.exclude);
    let options = SyncOptions {
        local_root: absolute(local_root)?,
        remote_root_id,
        diff: DiffOptions {
            direction,
            delete_extraneous: args.delete_extraneous,
            resolution,
        },
        dry_run: args.dry_run,
        concurrency,
        exclude,
        show_progress: config.show_progress,
    };
    tracing::info!(
        local = %options.local_root.display(),
        remote = %options.remote_root_id,
        ?direction,
        dry_run = options.dry_run,
        "Starting sync"
    );

    let store = Arc::new(DirectoryStore::open(&config.store_dir, chunk_size)?);
    let cache = Arc::new(FingerprintCache::load(&config.cache_path)?);

    let report = run_until_interrupted(|cancel| async move {
        let mut engine = SyncEngine::new(store, cache, cancel);
        let report = engine.run(&options).await;
        tracing::debug!(phase = ?engine.phase(), "Sync finished");
        report
    })?;

    if report.dry_run {
        report.print_plan();
    }
    report.print_summary();

    if let Some(fatal) = report.fatal {
        return Err(fatal);
    }
    if report.conflicts > 0 && !std::io::stdin().is_terminal() {
        return Err(DriveError::UnresolvedConflicts {
            count: report.conflicts,
        });
    }
    if args.fail_on_error && report.failed() > 0 {
        return Err(DriveError::TransfersFailed {
            count: report.failed(),
        });
    }
    Ok(())
}

/// Cache keys are absolute paths, so relative roots are anchored first.
fn absolute(path: PathBuf) -> Result<PathBuf, DriveError> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}
