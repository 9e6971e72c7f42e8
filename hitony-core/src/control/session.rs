//! Session controller handle for outside collaborators.
//!
//! The firmware-update collaborator needs exactly two capabilities: close
//! the transport to free network buffers, and keep the control worker from
//! flagging that closure as an error or reconnecting while the update runs.
//! This handle is that surface — nobody outside the control worker touches
//! the transport itself.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SessionControl {
    suppress_reconnect: AtomicBool,
    close_requested: AtomicBool,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the update collaborator before downloading: the next
    /// transport loss is intentional and must not surface as an error.
    pub fn begin_update(&self) {
        self.suppress_reconnect.store(true, Ordering::Release);
        self.close_requested.store(true, Ordering::Release);
    }

    /// Called if the update is abandoned and normal operation resumes.
    pub fn end_update(&self) {
        self.suppress_reconnect.store(false, Ordering::Release);
    }

    pub fn reconnect_suppressed(&self) -> bool {
        self.suppress_reconnect.load(Ordering::Acquire)
    }

    /// Taken by the control worker; closing is performed at most once.
    pub(crate) fn take_close_request(&self) -> bool {
        self.close_requested.swap(false, Ordering::AcqRel)
    }
}
