use crate::error::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

/// Quiet period before a burst of file events is reported as one change.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// A live watch on a single file. Dropping it stops the watch.
pub struct FileWatch {
    task: JoinHandle<()>,
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Call `on_change` (from a tokio task) after `path` is created, modified or
/// removed and then left alone for `debounce`.
///
/// The parent directory is watched rather than the file itself so that
/// editors which save by rename keep triggering.
pub fn watch_file<F>(path: &Path, debounce: Duration, on_change: F) -> Result<FileWatch>
where
    F: Fn() + Send + 'static,
{
    let dir = path.parent().unwrap_or(Path::new("."));
    let name: Option<OsString> = path.file_name().map(ToOwned::to_owned);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::debug!("watching {}", path.display());

    let task = tokio::spawn(async move {
        let _watcher = watcher;
        let mut pending: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                res = rx.recv() => match res {
                    Some(Ok(event)) => {
                        if touches(&event, name.as_deref()) {
                            pending = Some(Box::pin(tokio::time::sleep(debounce)));
                        }
                    }
                    Some(Err(e)) => tracing::warn!("watch error: {e}"),
                    None => break,
                },
                _ = async {
                    match pending.as_mut() {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => {
                    pending = None;
                    on_change();
                }
            }
        }
    });

    Ok(FileWatch { task })
}

fn touches(event: &Event, name: Option<&std::ffi::OsStr>) -> bool {
    let kind = &event.kind;
    if !(kind.is_modify() || kind.is_create() || kind.is_remove()) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| name.is_none() || p.file_name() == name)
}
