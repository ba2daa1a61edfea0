//! Advisory change notification for loaded configuration sources.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::loader::Config;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the documents behind a [`Config`] snapshot for modification.
///
/// Watching is advisory: the callback fires on a dedicated task when any
/// source document's modification time changes, and reload semantics are
/// entirely the subscriber's choice. Dropping the watcher stops it.
pub struct ConfigWatcher {
    worker: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Starts watching the sources of `config`, invoking `callback` on each
    /// observed change.
    #[must_use]
    pub fn spawn<F>(config: &Config, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let sources: Vec<PathBuf> = config.sources().to_vec();
        let worker = tokio::spawn(async move {
            let mut stamps = modification_times(&sources);
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = modification_times(&sources);
                if current != stamps {
                    debug!("configuration source changed");
                    stamps = current;
                    callback();
                }
            }
        });
        Self { worker }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn modification_times(sources: &[PathBuf]) -> Vec<Option<SystemTime>> {
    sources
        .iter()
        .map(|path| path.metadata().and_then(|m| m.modified()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::loader::ConfigLoader;
    use crate::paths::FabricPaths;

    #[tokio::test(start_paused = true)]
    async fn change_invokes_callback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = FabricPaths::rooted_at(dir.path()).expect("paths");
        let machine = paths.config_dir().join("machine.toml");
        std::fs::write(&machine, "bind_host = \"127.0.0.1\"\n").expect("write");

        let config = ConfigLoader::new(paths).load("tester").expect("load");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _watcher = ConfigWatcher::spawn(&config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Let the watcher record its baseline, then modify the document.
        tokio::time::advance(Duration::from_millis(10)).await;
        std::fs::write(&machine, "bind_host = \"0.0.0.0\"\n").expect("rewrite");
        for _ in 0..3 {
            tokio::time::advance(POLL_INTERVAL).await;
            tokio::task::yield_now().await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
