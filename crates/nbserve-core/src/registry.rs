//! Session registry.
//!
//! Maps notebook identity (resolved path) to its one live [`Session`].
//! Each map slot is a `OnceCell`, so concurrent first requests for the
//! same notebook start exactly one kernel and everyone waits on it.
//! Dead sessions are evicted and replaced on the next request.
//!
//! The registry expects paths that have already been resolved by the
//! access policy; it does not canonicalize on its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::config::ExecConfig;
use crate::error::Result;
use crate::kernel::KernelLauncher;
use crate::session::{Session, SessionState};

type Slot = Arc<OnceCell<Arc<Session>>>;

/// One row of [`SessionRegistry::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    pub path: PathBuf,
    pub state: SessionState,
    pub idle_for: Duration,
}

pub struct SessionRegistry<L: KernelLauncher> {
    launcher: Arc<L>,
    config: ExecConfig,
    sessions: Mutex<HashMap<PathBuf, Slot>>,
}

impl<L: KernelLauncher> SessionRegistry<L> {
    pub fn new(launcher: Arc<L>, config: ExecConfig) -> Self {
        Self {
            launcher,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the session for `path`, starting a kernel if none exists.
    ///
    /// A dead session found in the slot is evicted and replaced. A
    /// failed kernel start leaves the slot empty, so the next request
    /// simply tries again.
    pub async fn get_or_start(&self, path: impl AsRef<Path>) -> Result<Arc<Session>> {
        let path = path.as_ref();
        loop {
            let slot = self.slot_for(path);
            let session = slot
                .get_or_try_init(|| async {
                    tracing::info!(path = %path.display(), "starting kernel session");
                    Session::start(path, self.launcher.clone(), self.config.clone())
                        .await
                        .map(Arc::new)
                })
                .await?
                .clone();

            if session.state() != SessionState::Dead {
                return Ok(session);
            }
            tracing::info!(path = %path.display(), "evicting dead session");
            self.evict(path, &slot);
        }
    }

    /// Session for `path`, if one has been started.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(path.as_ref())
            .and_then(|slot| slot.get().cloned())
    }

    fn slot_for(&self, path: &Path) -> Slot {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Remove `slot` from the map, but only if it is still the one
    /// stored there. A concurrent evict-and-replace must not drop the
    /// replacement.
    fn evict(&self, path: &Path, slot: &Slot) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = sessions.get(path)
            && Arc::ptr_eq(current, slot)
        {
            sessions.remove(path);
        }
    }

    /// Shut down and remove the session for `path`. Returns whether a
    /// session existed.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        let slot = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(path.as_ref())
        };
        match slot.and_then(|s| s.get().cloned()) {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down every session. The registry stays usable afterwards.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(session) = slot.get() {
                session.shutdown().await;
            }
        }
    }

    /// Shut down sessions that have been idle past the configured
    /// limit. Busy and restarting sessions are left alone. Returns how
    /// many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let stale: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .values()
                .filter_map(|slot| slot.get().cloned())
                .filter(|s| {
                    matches!(s.state(), SessionState::Idle | SessionState::Dead)
                        && s.idle_for() >= self.config.max_idle
                })
                .collect()
        };

        let mut reaped = 0;
        for session in stale {
            tracing::info!(path = %session.path().display(), "reaping idle session");
            if self.remove(session.path().to_path_buf()).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Snapshot of every started session.
    pub fn status(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<SessionStatus> = sessions
            .values()
            .filter_map(|slot| slot.get())
            .map(|s| SessionStatus {
                path: s.path().to_path_buf(),
                state: s.state(),
                idle_for: s.idle_for(),
            })
            .collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }
}
