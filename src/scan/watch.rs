use super::{ScanRepo, ScanResult};
use crate::{error::*, registry::HttpClient};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[derive(Default)]
struct State {
    latest: Option<Arc<ScanResult>>,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rescans a repository on a background thread
///
/// The most recent successful [ScanResult] is shared with every reader. A
/// failed scan is logged and the previous result stays visible. Dropping
/// the watcher stops the thread after any scan in flight.
pub struct RepoWatcher {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RepoWatcher {
    pub fn spawn<H>(mut repo: ScanRepo<H>, interval: Duration) -> Self
    where
        H: HttpClient + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || loop {
            match repo.scan() {
                Ok(result) => {
                    let result = Arc::new(result.clone());
                    worker.lock().latest = Some(result);
                    worker.changed.notify_all();
                }
                Err(e) => log::error!("Repo scan failed: {}", e),
            }
            let state = worker.lock();
            let (state, _) = worker
                .changed
                .wait_timeout_while(state, interval, |s| !s.stop)
                .unwrap_or_else(|e| e.into_inner());
            if state.stop {
                log::debug!("Repo watcher stopped");
                break;
            }
        });
        RepoWatcher {
            shared,
            handle: Some(handle),
        }
    }

    /// Result of the last successful scan, if any
    pub fn latest(&self) -> Option<Arc<ScanResult>> {
        self.shared.lock().latest.clone()
    }

    /// Block until a scan result exists, at most `timeout`
    pub fn wait_for_scan(&self, timeout: Duration) -> Result<Arc<ScanResult>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(latest) = &state.latest {
                return Ok(Arc::clone(latest));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ScanNotReady(timeout));
            }
            log::info!("Scan results not available yet");
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Drop for RepoWatcher {
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Repo watcher thread panicked");
            }
        }
    }
}
