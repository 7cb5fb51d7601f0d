//! Background auto-commit
//!
//! A thread that wakes every `auto_commit_delay` and commits dirty maps.
//! It holds only a weak reference, so it never keeps a storage alive.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

use super::StorageShared;

pub(crate) struct AutoCommitter {
    stop: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutoCommitter {
    pub(crate) fn spawn(shared: Weak<StorageShared>, delay: Duration) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("aostore-auto-commit".into())
            .spawn(move || loop {
                match stopped.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.is_closed() {
                    break;
                }
                match shared.commit_dirty() {
                    Ok(0) => {}
                    Ok(count) => debug!(maps = count, "auto-commit"),
                    Err(e) => warn!(error = %e, "auto-commit failed"),
                }
            })?;

        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the thread and wait for it; idempotent
    pub(crate) fn stop(&self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("auto-commit thread panicked");
            }
        }
    }
}
