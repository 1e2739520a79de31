//! The MQTT engine behind a client context.
//!
//! An [`Engine`] is one client handle; an [`EngineFactory`] owns library-wide
//! state. Two implementations ship:
//! - [`mosquitto`]: libmosquitto loaded at runtime
//! - [`scripted`]: an in-process broker loopback for tests and offline scripts

pub mod loader;
pub mod mosquitto;
pub mod scripted;
pub mod topic;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::EventSink;
use crate::error::{BridgeError, Result};
use crate::reason::{translate_status, EngineResult};

/// MQTT protocol revision used for the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V31,
    V311,
}

impl ProtocolVersion {
    /// Parse a script-supplied name; absent means MQTT 3.1.
    pub fn from_name(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("mqttv31") => Ok(ProtocolVersion::V31),
            Some("mqttv311") => Ok(ProtocolVersion::V311),
            Some(other) => Err(BridgeError::InvalidArgument(format!(
                "unknown protocol version '{}' (expected 'mqttv31' or 'mqttv311')",
                other
            ))),
        }
    }

    /// Wire value of the protocol level.
    pub fn level(self) -> i32 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
        }
    }
}

/// Certificate material for `tls_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub cafile: Option<String>,
    pub capath: Option<String>,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
}

/// Engine library version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibVersion {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
}

impl fmt::Display for LibVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// One engine client handle.
///
/// Every method may be called from a handler running inside a driving call,
/// so implementations must not hold internal locks while raising events.
pub trait Engine: Send + Sync {
    /// Reset the handle to a fresh state, keeping the same sink.
    fn reinitialise(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<()>;

    fn will_set(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<()>;
    fn will_clear(&self) -> EngineResult<()>;
    fn login_set(&self, username: Option<&str>, password: Option<&str>) -> EngineResult<()>;

    fn tls_set(&self, files: &TlsFiles) -> EngineResult<()>;
    fn tls_insecure_set(&self, insecure: bool) -> EngineResult<()>;
    fn tls_opts_set(&self, cert_reqs: i32, tls_version: Option<&str>, ciphers: Option<&str>) -> EngineResult<()>;
    fn tls_psk_set(&self, psk: &str, identity: &str, ciphers: Option<&str>) -> EngineResult<()>;

    fn threaded_set(&self, threaded: bool) -> EngineResult<()>;
    fn protocol_version_set(&self, version: ProtocolVersion) -> EngineResult<()>;

    fn connect(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()>;
    fn connect_async(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()>;
    fn reconnect(&self) -> EngineResult<()>;
    fn reconnect_async(&self) -> EngineResult<()>;
    fn reconnect_delay_set(&self, delay: u32, delay_max: u32, exponential: bool) -> EngineResult<()>;
    fn disconnect(&self) -> EngineResult<()>;

    /// Returns the message id.
    fn publish(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<i32>;
    fn subscribe(&self, pattern: &str, qos: i32) -> EngineResult<i32>;
    fn unsubscribe(&self, pattern: &str) -> EngineResult<i32>;

    fn loop_iterate(&self, timeout_ms: i32, max_packets: i32) -> EngineResult<()>;
    fn loop_forever(&self, timeout_ms: i32, max_packets: i32) -> EngineResult<()>;
    fn loop_start(&self) -> EngineResult<()>;
    fn loop_stop(&self, force: bool) -> EngineResult<()>;
    fn loop_read(&self, max_packets: i32) -> EngineResult<()>;
    fn loop_write(&self, max_packets: i32) -> EngineResult<()>;
    fn loop_misc(&self) -> EngineResult<()>;

    fn socket(&self) -> Option<i32>;
    fn want_write(&self) -> bool;
}

/// Library-wide engine operations and handle creation.
pub trait EngineFactory: Send + Sync {
    fn lib_init(&self) -> EngineResult<()>;
    fn lib_cleanup(&self);
    fn lib_version(&self) -> LibVersion;

    /// Create a handle whose events are reported through `sink`.
    fn create(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<Box<dyn Engine>>;

    fn topic_matches_sub(&self, pattern: &str, topic: &str) -> EngineResult<bool>;
}

/// A shared factory with a count of its users.
///
/// Library init runs when the first [`LibraryUse`] is taken and cleanup when the
/// last one is released.
#[derive(Clone)]
pub struct EngineLibrary {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    factory: Arc<dyn EngineFactory>,
    users: Mutex<usize>,
}

impl EngineLibrary {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(LibraryInner {
                factory,
                users: Mutex::new(0),
            }),
        }
    }

    pub fn factory(&self) -> &Arc<dyn EngineFactory> {
        &self.inner.factory
    }

    /// Register a user, initialising the library if it is the first.
    pub fn acquire(&self) -> Result<LibraryUse> {
        let mut users = self.inner.users.lock();
        if *users == 0 {
            self.inner
                .factory
                .lib_init()
                .map_err(|e| BridgeError::EngineUnavailable(e.to_string()))?;
            tracing::debug!("engine library initialised");
        }
        *users += 1;
        Ok(LibraryUse {
            library: self.clone(),
        })
    }

    pub fn users(&self) -> usize {
        *self.inner.users.lock()
    }

    pub fn version(&self) -> LibVersion {
        self.inner.factory.lib_version()
    }

    pub fn topic_matches_sub(&self, pattern: &str, topic: &str) -> Result<bool> {
        self.inner
            .factory
            .topic_matches_sub(pattern, topic)
            .map_err(translate_status)
    }

    fn release(&self) {
        let mut users = self.inner.users.lock();
        *users = users.saturating_sub(1);
        if *users == 0 {
            self.inner.factory.lib_cleanup();
            tracing::debug!("engine library cleaned up");
        }
    }
}

impl fmt::Debug for EngineLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLibrary")
            .field("users", &self.users())
            .finish()
    }
}

/// Keeps the engine library initialised while held.
pub struct LibraryUse {
    library: EngineLibrary,
}

impl LibraryUse {
    pub fn library(&self) -> &EngineLibrary {
        &self.library
    }
}

impl Drop for LibraryUse {
    fn drop(&mut self) {
        self.library.release();
    }
}
