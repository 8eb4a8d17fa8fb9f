//! Watch-folder adapter.
//!
//! The detector writes each image under a temporary name and renames it into
//! the watch folder when complete, so only rename-into-folder events mean "a
//! finished file is ready". Those are forwarded as [`WatchEvent`]s on a tokio
//! channel; everything else is ignored.

use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use pilatus_core::{StreamError, StreamResult};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

/// A completed file appeared in the watch folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Name of the file relative to the watch folder
    pub file_name: String,
}

impl WatchEvent {
    /// Event for `file_name`.
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

/// Keeps the underlying OS watch alive; drop it to stop watching.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    folder: PathBuf,
}

impl FolderWatcher {
    /// Watch `folder` (non-recursively).
    ///
    /// Failure to register the watch is a configuration error.
    pub fn new(folder: &Path, capacity: usize) -> StreamResult<(Self, mpsc::Receiver<WatchEvent>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_name in completed_files(&event) {
                    // Sync callback on the notify thread
                    if tx.blocking_send(WatchEvent { file_name }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })
        .map_err(|e| StreamError::Configuration(format!("cannot create file watcher: {e}")))?;

        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .map_err(|e| {
                StreamError::Configuration(format!("cannot watch {}: {e}", folder.display()))
            })?;
        info!(folder = %folder.display(), "Watching for new images");

        Ok((
            Self {
                _watcher: watcher,
                folder: folder.to_path_buf(),
            },
            rx,
        ))
    }

    /// The watched folder.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

/// File names that an event reports as moved into the folder.
fn completed_files(event: &Event) -> Vec<String> {
    let destination = match event.kind {
        // inotify: IN_MOVED_TO; the single path is the destination
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.first(),
        // Backends that cannot tell rename sides apart report both; keep the
        // one that still exists.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().find(|path| path.is_file())
        }
        _ => {
            trace!(kind = ?event.kind, "Ignoring file event");
            None
        }
    };

    destination
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_rename_to_is_reported() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/data/scan0_00001.cbf"));
        assert_eq!(completed_files(&event), vec!["scan0_00001.cbf"]);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/data/tmp.cbf"));
        assert!(completed_files(&create).is_empty());

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from("/data/scan0.cbf"));
        assert!(completed_files(&from).is_empty());
    }

    #[test]
    fn test_watch_nonexistent_path() {
        let result = FolderWatcher::new(Path::new("/nonexistent/path/that/does/not/exist"), 8);
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_rename_into_folder_is_delivered() {
        let outside = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let (watcher, mut rx) = FolderWatcher::new(watched.path(), 8).unwrap();
        assert_eq!(watcher.folder(), watched.path());

        let staging = outside.path().join("partial.tmp");
        std::fs::write(&staging, b"pixels").unwrap();
        std::fs::rename(&staging, watched.path().join("scan0.cbf")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, WatchEvent::new("scan0.cbf"));
    }
}
