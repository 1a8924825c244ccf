//! Background heartbeat while a cycle runs.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::io::status::StatusStore;

/// Refreshes the status heartbeat every `interval` until dropped.
///
/// Only the `heartbeat` field is touched; every other field belongs to the
/// main state machine.
pub struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(status: StatusStore, interval: Duration) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = status.touch_heartbeat() {
                            warn!("heartbeat update failed: {err:#}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("heartbeat stopped");
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread immediately.
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("heartbeat thread panicked");
        }
    }
}
