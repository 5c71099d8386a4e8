//! Polling file watcher that triggers worker reloads.
//!
//! Walks the configured directories at a fixed interval and compares
//! modification times against the previous snapshot. Dependency and VCS
//! directories are skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// File extensions that participate in change detection.
const WATCHED_EXTENSIONS: &[&str] = &["php", "inc", "phtml"];

/// Directory names that are never descended into.
const SKIP_DIRS: &[&str] = &["vendor", "node_modules", ".git"];

/// Callback invoked when a change is detected.
pub type ChangeHandler = Box<dyn Fn() + Send + Sync>;

/// Watches a set of directories for changes to worker source files.
pub struct Watcher {
    dirs: Vec<PathBuf>,
    interval: std::time::Duration,
    cancel: CancellationToken,
}

impl Watcher {
    pub fn new(dirs: Vec<PathBuf>, interval: std::time::Duration) -> Self {
        Self {
            dirs,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Take the initial snapshot and start the polling task. The handler is
    /// invoked at most once per tick, however many files changed.
    pub fn start(&self, on_change: ChangeHandler) {
        let dirs = self.dirs.clone();
        let poll_interval = self.interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut mtimes = scan_blocking(dirs.clone()).await;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = scan_blocking(dirs.clone()).await;
                        if detect_changes(&mtimes, &current) {
                            info!("file changes detected, reloading workers");
                            on_change();
                        }
                        mtimes = current;
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        info!(dirs = ?self.dirs, interval = ?self.interval, "file watcher started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Walk the trees off the async runtime; directory trees can be large.
async fn scan_blocking(dirs: Vec<PathBuf>) -> HashMap<PathBuf, SystemTime> {
    tokio::task::spawn_blocking(move || scan(&dirs))
        .await
        .unwrap_or_default()
}

/// Snapshot modification times of every watched file under `dirs`.
fn scan(dirs: &[PathBuf]) -> HashMap<PathBuf, SystemTime> {
    let mut mtimes = HashMap::new();
    for dir in dirs {
        walk(dir, &mut mtimes);
    }
    mtimes
}

fn walk(dir: &Path, out: &mut HashMap<PathBuf, SystemTime>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIP_DIRS.iter().any(|s| name == std::ffi::OsStr::new(s)) {
                continue;
            }
            walk(&path, out);
        } else if is_watched_file(&path)
            && let Ok(meta) = entry.metadata()
            && let Ok(modified) = meta.modified()
        {
            out.insert(path, modified);
        }
    }
}

fn is_watched_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            WATCHED_EXTENSIONS.iter().any(|w| *w == ext)
        })
        .unwrap_or(false)
}

/// True when any watched file is newer, has appeared, or has disappeared.
fn detect_changes(
    old: &HashMap<PathBuf, SystemTime>,
    new: &HashMap<PathBuf, SystemTime>,
) -> bool {
    let mut changed = false;
    for (path, modified) in new {
        match old.get(path) {
            Some(previous) => {
                if modified > previous {
                    debug!(path = %path.display(), "file changed");
                    changed = true;
                }
            }
            None => {
                debug!(path = %path.display(), "new file detected");
                changed = true;
            }
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            debug!(path = %path.display(), "file deleted");
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_watched_file() {
        assert!(is_watched_file(Path::new("index.php")));
        assert!(is_watched_file(Path::new("lib/helpers.inc")));
        assert!(is_watched_file(Path::new("views/home.PHTML")));
        assert!(!is_watched_file(Path::new("style.css")));
        assert!(!is_watched_file(Path::new("Makefile")));
    }

    #[test]
    fn test_scan_filters_extensions_and_skip_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("index.php"), "<?php").unwrap();
        std::fs::write(root.join("notes.txt"), "skip me").unwrap();
        std::fs::create_dir(root.join("vendor")).unwrap();
        std::fs::write(root.join("vendor/dep.php"), "<?php").unwrap();
        std::fs::create_dir(root.join("app")).unwrap();
        std::fs::write(root.join("app/worker.php"), "<?php").unwrap();

        let mtimes = scan(&[root.to_path_buf()]);
        assert_eq!(mtimes.len(), 2);
        assert!(mtimes.contains_key(&root.join("index.php")));
        assert!(mtimes.contains_key(&root.join("app/worker.php")));
    }

    #[test]
    fn test_detect_changes_on_modification() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let old = HashMap::from([(PathBuf::from("a.php"), base)]);
        let same = old.clone();
        assert!(!detect_changes(&old, &same));

        let newer = HashMap::from([(PathBuf::from("a.php"), base + Duration::from_secs(5))]);
        assert!(detect_changes(&old, &newer));
    }

    #[test]
    fn test_detect_changes_on_new_and_deleted_files() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let old = HashMap::from([(PathBuf::from("a.php"), base)]);

        let with_new = HashMap::from([
            (PathBuf::from("a.php"), base),
            (PathBuf::from("b.php"), base),
        ]);
        assert!(detect_changes(&old, &with_new));

        let empty = HashMap::new();
        assert!(detect_changes(&old, &empty));
    }

    #[tokio::test]
    async fn test_watcher_invokes_handler_once_per_tick() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.php"), "<?php // v1").unwrap();

        let watcher = Watcher::new(vec![tmp.path().to_path_buf()], Duration::from_millis(50));
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_clone = std::sync::Arc::clone(&fired);
        watcher.start(Box::new(move || {
            fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        // Let the initial snapshot settle, then add two files at once.
        tokio::time::sleep(Duration::from_millis(120)).await;
        std::fs::write(tmp.path().join("new_one.php"), "<?php").unwrap();
        std::fs::write(tmp.path().join("new_two.php"), "<?php").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        watcher.stop();
        let count = fired.load(std::sync::atomic::Ordering::SeqCst);
        assert!(count >= 1, "handler never fired");
        assert!(count <= 2, "handler fired {} times for one burst", count);
    }
}
