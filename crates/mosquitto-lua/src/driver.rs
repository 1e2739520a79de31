//! Driving the engine's network loop.
//!
//! Every driving call installs the host runtime in the context's session slot
//! for exactly as long as the engine may raise events on its behalf.

use std::sync::Arc;

use crate::context::{ContextShared, DriveMode};
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::host::HostRuntime;
use crate::reason::{translate_status, EngineResult};

/// Foreground session guard. The slot is cleared on every exit path.
struct DrivingSession<'s, H: HostRuntime> {
    shared: &'s ContextShared<H>,
}

impl<'s, H: HostRuntime> DrivingSession<'s, H> {
    fn begin(shared: &'s ContextShared<H>, host: H) -> Result<Self> {
        shared.begin_session(host, DriveMode::Foreground)?;
        Ok(Self { shared })
    }
}

impl<H: HostRuntime> Drop for DrivingSession<'_, H> {
    fn drop(&mut self) {
        self.shared.end_session();
    }
}

/// Loop operations for one context.
pub struct LoopDriver<'c, H: HostRuntime> {
    shared: &'c Arc<ContextShared<H>>,
}

impl<'c, H: HostRuntime> LoopDriver<'c, H> {
    pub(crate) fn new(shared: &'c Arc<ContextShared<H>>) -> Self {
        Self { shared }
    }

    fn foreground<T>(&self, host: H, op: impl FnOnce(&dyn Engine) -> EngineResult<T>) -> Result<T> {
        let engine = self.shared.engine()?;
        let _session = DrivingSession::begin(self.shared, host)?;
        op(&**engine).map_err(translate_status)
    }

    /// One network iteration, waiting at most `timeout_ms` (negative: engine default).
    pub fn run_once(&self, host: H, timeout_ms: i32, max_packets: i32) -> Result<()> {
        self.foreground(host, |engine| engine.loop_iterate(timeout_ms, max_packets))
    }

    /// Iterate until the engine ends the session (typically after `disconnect`).
    pub fn run_forever(&self, host: H, timeout_ms: i32, max_packets: i32) -> Result<()> {
        self.foreground(host, |engine| engine.loop_forever(timeout_ms, max_packets))
    }

    pub fn drive_read(&self, host: H, max_packets: i32) -> Result<()> {
        self.foreground(host, |engine| engine.loop_read(max_packets))
    }

    pub fn drive_write(&self, host: H, max_packets: i32) -> Result<()> {
        self.foreground(host, |engine| engine.loop_write(max_packets))
    }

    pub fn drive_misc(&self, host: H) -> Result<()> {
        self.foreground(host, |engine| engine.loop_misc())
    }

    /// Hand iteration to an engine-owned thread. Events raised there run on `host`.
    pub fn start_background(&self, host: H) -> Result<()> {
        let engine = self.shared.engine()?;
        self.shared.begin_session(host, DriveMode::Background)?;

        if let Err(err) = engine.loop_start() {
            self.shared.end_session();
            return Err(translate_status(err));
        }

        tracing::debug!(context = %self.shared.id, "background loop started");
        Ok(())
    }

    /// Stop the background thread.
    ///
    /// A forced stop does not wait for in-flight handlers and always clears the
    /// session. A graceful stop clears it only once the engine reports the thread
    /// has stopped.
    pub fn stop_background(&self, force: bool) -> Result<()> {
        let engine = self.shared.engine()?;
        if self.shared.session_mode() != Some(DriveMode::Background) {
            return Err(BridgeError::NotDriving);
        }

        let result = engine.loop_stop(force);
        if result.is_ok() || force {
            self.shared.end_session();
        }

        tracing::debug!(context = %self.shared.id, force, ok = result.is_ok(), "background loop stopped");
        result.map_err(translate_status)
    }
}
