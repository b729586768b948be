// src/watcher.rs
use anyhow::Result;
use notify::event::{EventKind, ModifyKind};
use notify::Watcher as NotifyWatcherTrait; // To use .watcher() and .cache()
use notify_debouncer_full::{new_debouncer, DebouncedEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info, warn};

use crate::dir::Dir;
use crate::msg::{Msg, MsgKind};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Runs the file system watcher in a background thread.
///
/// Every served directory is watched recursively. Debounced events are turned
/// into [`Msg`]s by [`event_to_msg`] and sent through `msg_tx`. The thread
/// ends when the receiving side of `msg_tx` is dropped.
pub async fn run_watcher(dirs: Arc<Vec<Dir>>, key: Option<String>, msg_tx: Sender<Msg>) -> Result<()> {
    std::thread::spawn(move || {
        let (debouncer_tx, debouncer_rx) = std::sync::mpsc::channel();

        let mut debouncer = match new_debouncer(DEBOUNCE, None, debouncer_tx) {
            Ok(d) => d,
            Err(e) => {
                error!("[WatcherThread] Failed to create debouncer: {}", e);
                return;
            }
        };

        for dir in dirs.iter() {
            let path = dir.root();
            if !path.is_dir() {
                warn!(
                    "[WatcherThread] Not a directory, skipping: {}",
                    path.display()
                );
                continue;
            }
            match debouncer
                .watcher()
                .watch(path, notify::RecursiveMode::Recursive)
            {
                Ok(_) => info!("[WatcherThread] Watching {}", path.display()),
                Err(e) => error!("[WatcherThread] Failed to watch {}: {}", path.display(), e),
            }
            debouncer
                .cache()
                .add_root(path, notify::RecursiveMode::Recursive);
        }

        while let Ok(result) = debouncer_rx.recv() {
            match result {
                Ok(events) => {
                    for event in events {
                        let Some(msg) = event_to_msg(&dirs, &event) else {
                            continue;
                        };
                        let msg = msg.with_key(key.clone());
                        debug!("[WatcherThread] Produced message: {:?}", msg);
                        if msg_tx.blocking_send(msg).is_err() {
                            info!("[WatcherThread] Receiver dropped, exiting.");
                            return;
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        error!("[WatcherThread] Debouncer reported error: {:?}", error);
                    }
                }
            }
        }
        info!("[WatcherThread] Debouncer channel closed, exiting.");
    });

    Ok(())
}

/// Maps one debounced event to a message, or `None` when the event is
/// irrelevant or no directory admits its path.
///
/// Content modifications become `change`; creation, removal and renames
/// become `rename`. The message path is relative to the first directory whose
/// allow-test accepts it.
pub fn event_to_msg(dirs: &[Dir], event: &DebouncedEvent) -> Option<Msg> {
    let kind = match event.kind {
        EventKind::Modify(ModifyKind::Name(_)) => MsgKind::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) => MsgKind::Change,
        EventKind::Create(_) | EventKind::Remove(_) => MsgKind::Rename,
        _ => {
            debug!("[WatcherThread] Ignored event kind: {:?}", event.kind);
            return None;
        }
    };
    let path = event.paths.last()?;
    let rel = first_allowed(dirs, path)?;
    Some(Msg::new(kind).with_path(rel))
}

fn first_allowed(dirs: &[Dir], path: &Path) -> Option<String> {
    dirs.iter()
        .find(|dir| dir.allow_path(path))
        .map(|dir| dir.rel(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::PathTest;
    use notify::event::{AccessKind, CreateKind, DataChange, Event, RenameMode};
    use std::path::PathBuf;
    use std::time::Instant;

    fn debounced(kind: EventKind, paths: Vec<PathBuf>) -> DebouncedEvent {
        let mut event = Event::new(kind);
        event.paths = paths;
        DebouncedEvent::new(event, Instant::now())
    }

    #[test]
    fn maps_kinds() {
        let root = std::env::temp_dir();
        let dirs = vec![Dir::new(&root)];
        let file = dirs[0].root().join("style.css");

        let change = debounced(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec![file.clone()],
        );
        assert_eq!(
            event_to_msg(&dirs, &change),
            Some(Msg::new(MsgKind::Change).with_path("style.css"))
        );

        let created = debounced(EventKind::Create(CreateKind::File), vec![file.clone()]);
        assert_eq!(event_to_msg(&dirs, &created).unwrap().kind, MsgKind::Rename);

        let renamed = debounced(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![dirs[0].root().join("old.css"), file.clone()],
        );
        assert_eq!(
            event_to_msg(&dirs, &renamed).unwrap().path.as_deref(),
            Some("style.css")
        );

        let accessed = debounced(EventKind::Access(AccessKind::Any), vec![file]);
        assert_eq!(event_to_msg(&dirs, &accessed), None);
    }

    #[test]
    fn drops_paths_no_dir_admits() {
        let root = std::env::temp_dir();
        let dirs = vec![Dir::new(&root).with_test(PathTest::hide(r"(^|/)[.]").unwrap())];

        let hidden = debounced(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            vec![dirs[0].root().join(".cache/x")],
        );
        assert_eq!(event_to_msg(&dirs, &hidden), None);

        let outside = debounced(
            EventKind::Create(CreateKind::File),
            vec![PathBuf::from("/definitely/not/under/tmp.css")],
        );
        assert_eq!(event_to_msg(&dirs, &outside), None);
    }

    #[test]
    fn first_admitting_dir_wins() {
        let root = std::env::temp_dir();
        let nested = root.join("nested");
        let dirs = vec![
            Dir::new(&nested).with_test(PathTest::func(|_| false)),
            Dir::new(&root),
        ];
        let path = dirs[1].root().join("nested/a.js");
        assert_eq!(first_allowed(&dirs, &path).as_deref(), Some("nested/a.js"));
    }
}
