//! libmosquitto, loaded at runtime.
//!
//! Every symbol is resolved once when the library is loaded. Handles receive the
//! context id as their user-data word; the `extern "C"` thunks turn it back into
//! an [`EventSink`] and never let a panic cross into C.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use libloading::Library;
use mosquitto_lua_config::Settings;
use parking_lot::Mutex;

use super::loader::{resolve, LibraryLoader, LoadError};
use super::{Engine, EngineFactory, EngineLibrary, LibVersion, ProtocolVersion, TlsFiles};
use crate::bridge::EventSink;
use crate::event::EngineEvent;
use crate::guarded;
use crate::reason::{EngineError, EngineResult, StatusCode};

const MOSQ_OPT_PROTOCOL_VERSION: c_int = 1;

#[repr(C)]
struct RawMosquitto {
    _private: [u8; 0],
}

#[repr(C)]
struct RawMessage {
    mid: c_int,
    topic: *mut c_char,
    payload: *mut c_void,
    payloadlen: c_int,
    qos: c_int,
    retain: bool,
}

type Handle = *mut RawMosquitto;

type OnIntCb = unsafe extern "C" fn(Handle, *mut c_void, c_int);
type OnMessageCb = unsafe extern "C" fn(Handle, *mut c_void, *const RawMessage);
type OnSubscribeCb = unsafe extern "C" fn(Handle, *mut c_void, c_int, c_int, *const c_int);
type OnLogCb = unsafe extern "C" fn(Handle, *mut c_void, c_int, *const c_char);
type PwCallback = unsafe extern "C" fn(*mut c_char, c_int, c_int, *mut c_void) -> c_int;

/// Resolved libmosquitto entry points.
struct MosquittoApi {
    name: String,
    lib_init: unsafe extern "C" fn() -> c_int,
    lib_cleanup: unsafe extern "C" fn() -> c_int,
    lib_version: unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_int) -> c_int,
    strerror: unsafe extern "C" fn(c_int) -> *const c_char,
    topic_matches_sub: unsafe extern "C" fn(*const c_char, *const c_char, *mut bool) -> c_int,

    new: unsafe extern "C" fn(*const c_char, bool, *mut c_void) -> Handle,
    destroy: unsafe extern "C" fn(Handle),
    reinitialise: unsafe extern "C" fn(Handle, *const c_char, bool, *mut c_void) -> c_int,

    will_set: unsafe extern "C" fn(Handle, *const c_char, c_int, *const c_void, c_int, bool) -> c_int,
    will_clear: unsafe extern "C" fn(Handle) -> c_int,
    username_pw_set: unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
    tls_set: unsafe extern "C" fn(
        Handle,
        *const c_char,
        *const c_char,
        *const c_char,
        *const c_char,
        Option<PwCallback>,
    ) -> c_int,
    tls_insecure_set: unsafe extern "C" fn(Handle, bool) -> c_int,
    tls_opts_set: unsafe extern "C" fn(Handle, c_int, *const c_char, *const c_char) -> c_int,
    tls_psk_set: unsafe extern "C" fn(Handle, *const c_char, *const c_char, *const c_char) -> c_int,
    threaded_set: unsafe extern "C" fn(Handle, bool) -> c_int,
    opts_set: unsafe extern "C" fn(Handle, c_int, *mut c_void) -> c_int,

    connect: unsafe extern "C" fn(Handle, *const c_char, c_int, c_int) -> c_int,
    connect_async: unsafe extern "C" fn(Handle, *const c_char, c_int, c_int) -> c_int,
    reconnect: unsafe extern "C" fn(Handle) -> c_int,
    reconnect_async: unsafe extern "C" fn(Handle) -> c_int,
    reconnect_delay_set: unsafe extern "C" fn(Handle, c_uint, c_uint, bool) -> c_int,
    disconnect: unsafe extern "C" fn(Handle) -> c_int,

    publish: unsafe extern "C" fn(Handle, *mut c_int, *const c_char, c_int, *const c_void, c_int, bool) -> c_int,
    subscribe: unsafe extern "C" fn(Handle, *mut c_int, *const c_char, c_int) -> c_int,
    unsubscribe: unsafe extern "C" fn(Handle, *mut c_int, *const c_char) -> c_int,

    loop_iterate: unsafe extern "C" fn(Handle, c_int, c_int) -> c_int,
    loop_forever: unsafe extern "C" fn(Handle, c_int, c_int) -> c_int,
    loop_start: unsafe extern "C" fn(Handle) -> c_int,
    loop_stop: unsafe extern "C" fn(Handle, bool) -> c_int,
    loop_read: unsafe extern "C" fn(Handle, c_int) -> c_int,
    loop_write: unsafe extern "C" fn(Handle, c_int) -> c_int,
    loop_misc: unsafe extern "C" fn(Handle) -> c_int,
    socket: unsafe extern "C" fn(Handle) -> c_int,
    want_write: unsafe extern "C" fn(Handle) -> bool,

    connect_callback_set: unsafe extern "C" fn(Handle, Option<OnIntCb>),
    disconnect_callback_set: unsafe extern "C" fn(Handle, Option<OnIntCb>),
    publish_callback_set: unsafe extern "C" fn(Handle, Option<OnIntCb>),
    message_callback_set: unsafe extern "C" fn(Handle, Option<OnMessageCb>),
    subscribe_callback_set: unsafe extern "C" fn(Handle, Option<OnSubscribeCb>),
    unsubscribe_callback_set: unsafe extern "C" fn(Handle, Option<OnIntCb>),
    log_callback_set: unsafe extern "C" fn(Handle, Option<OnLogCb>),

    // Keeps every pointer above mapped.
    _library: Arc<Library>,
}

macro_rules! symbols {
    ($library:expr, $name:expr, { $($field:ident = $symbol:literal),* $(,)? }) => {
        MosquittoApi {
            name: $name.to_string(),
            $($field: resolve(&$library, $name, $symbol)?,)*
            _library: $library.clone(),
        }
    };
}

impl MosquittoApi {
    fn load(library: Arc<Library>, name: &str) -> Result<Self, LoadError> {
        // SAFETY: each field's type mirrors the libmosquitto prototype of its symbol.
        unsafe {
            Ok(symbols!(library, name, {
                lib_init = "mosquitto_lib_init",
                lib_cleanup = "mosquitto_lib_cleanup",
                lib_version = "mosquitto_lib_version",
                strerror = "mosquitto_strerror",
                topic_matches_sub = "mosquitto_topic_matches_sub",
                new = "mosquitto_new",
                destroy = "mosquitto_destroy",
                reinitialise = "mosquitto_reinitialise",
                will_set = "mosquitto_will_set",
                will_clear = "mosquitto_will_clear",
                username_pw_set = "mosquitto_username_pw_set",
                tls_set = "mosquitto_tls_set",
                tls_insecure_set = "mosquitto_tls_insecure_set",
                tls_opts_set = "mosquitto_tls_opts_set",
                tls_psk_set = "mosquitto_tls_psk_set",
                threaded_set = "mosquitto_threaded_set",
                opts_set = "mosquitto_opts_set",
                connect = "mosquitto_connect",
                connect_async = "mosquitto_connect_async",
                reconnect = "mosquitto_reconnect",
                reconnect_async = "mosquitto_reconnect_async",
                reconnect_delay_set = "mosquitto_reconnect_delay_set",
                disconnect = "mosquitto_disconnect",
                publish = "mosquitto_publish",
                subscribe = "mosquitto_subscribe",
                unsubscribe = "mosquitto_unsubscribe",
                loop_iterate = "mosquitto_loop",
                loop_forever = "mosquitto_loop_forever",
                loop_start = "mosquitto_loop_start",
                loop_stop = "mosquitto_loop_stop",
                loop_read = "mosquitto_loop_read",
                loop_write = "mosquitto_loop_write",
                loop_misc = "mosquitto_loop_misc",
                socket = "mosquitto_socket",
                want_write = "mosquitto_want_write",
                connect_callback_set = "mosquitto_connect_callback_set",
                disconnect_callback_set = "mosquitto_disconnect_callback_set",
                publish_callback_set = "mosquitto_publish_callback_set",
                message_callback_set = "mosquitto_message_callback_set",
                subscribe_callback_set = "mosquitto_subscribe_callback_set",
                unsubscribe_callback_set = "mosquitto_unsubscribe_callback_set",
                log_callback_set = "mosquitto_log_callback_set",
            }))
        }
    }

    /// Library's own text for a status code.
    fn strerror(&self, rc: c_int) -> Option<String> {
        let text = unsafe { (self.strerror)(rc) };
        if text.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
    }
}

fn c_string(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| EngineError::new(StatusCode::Inval))
}

fn c_string_opt(s: Option<&str>) -> EngineResult<Option<CString>> {
    s.map(c_string).transpose()
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(ptr::null(), |c| c.as_ptr())
}

fn payload_parts(payload: Option<&[u8]>) -> EngineResult<(c_int, *const c_void)> {
    match payload {
        None | Some([]) => Ok((0, ptr::null())),
        Some(bytes) => {
            let len = c_int::try_from(bytes.len()).map_err(|_| EngineError::new(StatusCode::PayloadSize))?;
            Ok((len, bytes.as_ptr().cast()))
        }
    }
}

// ===== Callback thunks =====

fn forward(obj: *mut c_void, build: impl FnOnce() -> Option<EngineEvent>) {
    guarded::contain("mosquitto callback", || {
        if let Some(event) = build() {
            EventSink::from_user_data(obj).raise(event);
        }
    });
}

unsafe fn owned_text(text: *const c_char) -> String {
    if text.is_null() {
        String::new()
    } else {
        CStr::from_ptr(text).to_string_lossy().into_owned()
    }
}

unsafe fn owned_bytes(data: *const c_void, len: c_int) -> Vec<u8> {
    match usize::try_from(len) {
        Ok(len) if len > 0 && !data.is_null() => std::slice::from_raw_parts(data.cast::<u8>(), len).to_vec(),
        _ => Vec::new(),
    }
}

extern "C" fn on_connect(_m: Handle, obj: *mut c_void, rc: c_int) {
    forward(obj, || Some(EngineEvent::Connect { rc }));
}

extern "C" fn on_disconnect(_m: Handle, obj: *mut c_void, rc: c_int) {
    forward(obj, || Some(EngineEvent::Disconnect { rc }));
}

extern "C" fn on_publish(_m: Handle, obj: *mut c_void, mid: c_int) {
    forward(obj, || Some(EngineEvent::Publish { mid }));
}

extern "C" fn on_message(_m: Handle, obj: *mut c_void, msg: *const RawMessage) {
    forward(obj, || {
        // SAFETY: libmosquitto passes a valid message for the duration of the call.
        let msg = unsafe { msg.as_ref() }?;
        Some(EngineEvent::Message {
            mid: msg.mid,
            topic: unsafe { owned_text(msg.topic) },
            payload: unsafe { owned_bytes(msg.payload, msg.payloadlen) },
            qos: msg.qos,
            retain: msg.retain,
        })
    });
}

extern "C" fn on_subscribe(_m: Handle, obj: *mut c_void, mid: c_int, qos_count: c_int, granted: *const c_int) {
    forward(obj, || {
        let granted_qos = match usize::try_from(qos_count) {
            Ok(n) if n > 0 && !granted.is_null() => unsafe { std::slice::from_raw_parts(granted, n) }.to_vec(),
            _ => Vec::new(),
        };
        Some(EngineEvent::Subscribe { mid, granted_qos })
    });
}

extern "C" fn on_unsubscribe(_m: Handle, obj: *mut c_void, mid: c_int) {
    forward(obj, || Some(EngineEvent::Unsubscribe { mid }));
}

extern "C" fn on_log(_m: Handle, obj: *mut c_void, level: c_int, text: *const c_char) {
    forward(obj, || {
        Some(EngineEvent::Log {
            level,
            message: unsafe { owned_text(text) },
        })
    });
}

// ===== Engine handle =====

/// One `struct mosquitto *`.
pub struct MosquittoEngine {
    api: Arc<MosquittoApi>,
    handle: NonNull<RawMosquitto>,
}

// SAFETY: libmosquitto handles may be used from any thread; the bridge never
// frees the handle while an operation holds a reference to this value.
unsafe impl Send for MosquittoEngine {}
unsafe impl Sync for MosquittoEngine {}

impl MosquittoEngine {
    fn raw(&self) -> Handle {
        self.handle.as_ptr()
    }

    fn install_callbacks(&self) {
        let api = &self.api;
        let m = self.raw();
        unsafe {
            (api.connect_callback_set)(m, Some(on_connect));
            (api.disconnect_callback_set)(m, Some(on_disconnect));
            (api.publish_callback_set)(m, Some(on_publish));
            (api.message_callback_set)(m, Some(on_message));
            (api.subscribe_callback_set)(m, Some(on_subscribe));
            (api.unsubscribe_callback_set)(m, Some(on_unsubscribe));
            (api.log_callback_set)(m, Some(on_log));
        }
    }

    fn status(&self, rc: c_int) -> EngineResult<()> {
        EngineError::check(rc).inspect_err(|_| {
            if let Some(text) = self.api.strerror(rc) {
                tracing::trace!(rc, error = %text, library = %self.api.name, "engine call failed");
            }
        })
    }
}

impl Drop for MosquittoEngine {
    fn drop(&mut self) {
        unsafe { (self.api.destroy)(self.raw()) };
    }
}

impl Engine for MosquittoEngine {
    fn reinitialise(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<()> {
        let id = c_string_opt(client_id)?;
        let rc = unsafe { (self.api.reinitialise)(self.raw(), opt_ptr(&id), clean_session, sink.as_user_data()) };
        self.status(rc)?;
        self.install_callbacks();
        Ok(())
    }

    fn will_set(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<()> {
        let topic = c_string(topic)?;
        let (len, data) = payload_parts(payload)?;
        self.status(unsafe { (self.api.will_set)(self.raw(), topic.as_ptr(), len, data, qos, retain) })
    }

    fn will_clear(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.will_clear)(self.raw()) })
    }

    fn login_set(&self, username: Option<&str>, password: Option<&str>) -> EngineResult<()> {
        let username = c_string_opt(username)?;
        let password = c_string_opt(password)?;
        self.status(unsafe { (self.api.username_pw_set)(self.raw(), opt_ptr(&username), opt_ptr(&password)) })
    }

    fn tls_set(&self, files: &TlsFiles) -> EngineResult<()> {
        let cafile = c_string_opt(files.cafile.as_deref())?;
        let capath = c_string_opt(files.capath.as_deref())?;
        let certfile = c_string_opt(files.certfile.as_deref())?;
        let keyfile = c_string_opt(files.keyfile.as_deref())?;
        self.status(unsafe {
            (self.api.tls_set)(
                self.raw(),
                opt_ptr(&cafile),
                opt_ptr(&capath),
                opt_ptr(&certfile),
                opt_ptr(&keyfile),
                None,
            )
        })
    }

    fn tls_insecure_set(&self, insecure: bool) -> EngineResult<()> {
        self.status(unsafe { (self.api.tls_insecure_set)(self.raw(), insecure) })
    }

    fn tls_opts_set(&self, cert_reqs: i32, tls_version: Option<&str>, ciphers: Option<&str>) -> EngineResult<()> {
        let tls_version = c_string_opt(tls_version)?;
        let ciphers = c_string_opt(ciphers)?;
        self.status(unsafe { (self.api.tls_opts_set)(self.raw(), cert_reqs, opt_ptr(&tls_version), opt_ptr(&ciphers)) })
    }

    fn tls_psk_set(&self, psk: &str, identity: &str, ciphers: Option<&str>) -> EngineResult<()> {
        let psk = c_string(psk)?;
        let identity = c_string(identity)?;
        let ciphers = c_string_opt(ciphers)?;
        self.status(unsafe { (self.api.tls_psk_set)(self.raw(), psk.as_ptr(), identity.as_ptr(), opt_ptr(&ciphers)) })
    }

    fn threaded_set(&self, threaded: bool) -> EngineResult<()> {
        self.status(unsafe { (self.api.threaded_set)(self.raw(), threaded) })
    }

    fn protocol_version_set(&self, version: ProtocolVersion) -> EngineResult<()> {
        let mut level: c_int = version.level();
        self.status(unsafe {
            (self.api.opts_set)(
                self.raw(),
                MOSQ_OPT_PROTOCOL_VERSION,
                (&mut level as *mut c_int).cast(),
            )
        })
    }

    fn connect(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()> {
        let host = c_string(host)?;
        self.status(unsafe { (self.api.connect)(self.raw(), host.as_ptr(), port, keepalive) })
    }

    fn connect_async(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()> {
        let host = c_string(host)?;
        self.status(unsafe { (self.api.connect_async)(self.raw(), host.as_ptr(), port, keepalive) })
    }

    fn reconnect(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.reconnect)(self.raw()) })
    }

    fn reconnect_async(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.reconnect_async)(self.raw()) })
    }

    fn reconnect_delay_set(&self, delay: u32, delay_max: u32, exponential: bool) -> EngineResult<()> {
        self.status(unsafe { (self.api.reconnect_delay_set)(self.raw(), delay, delay_max, exponential) })
    }

    fn disconnect(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.disconnect)(self.raw()) })
    }

    fn publish(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<i32> {
        let topic = c_string(topic)?;
        let (len, data) = payload_parts(payload)?;
        let mut mid: c_int = 0;
        self.status(unsafe { (self.api.publish)(self.raw(), &mut mid, topic.as_ptr(), len, data, qos, retain) })?;
        Ok(mid)
    }

    fn subscribe(&self, pattern: &str, qos: i32) -> EngineResult<i32> {
        let pattern = c_string(pattern)?;
        let mut mid: c_int = 0;
        self.status(unsafe { (self.api.subscribe)(self.raw(), &mut mid, pattern.as_ptr(), qos) })?;
        Ok(mid)
    }

    fn unsubscribe(&self, pattern: &str) -> EngineResult<i32> {
        let pattern = c_string(pattern)?;
        let mut mid: c_int = 0;
        self.status(unsafe { (self.api.unsubscribe)(self.raw(), &mut mid, pattern.as_ptr()) })?;
        Ok(mid)
    }

    fn loop_iterate(&self, timeout_ms: i32, max_packets: i32) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_iterate)(self.raw(), timeout_ms, max_packets) })
    }

    fn loop_forever(&self, timeout_ms: i32, max_packets: i32) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_forever)(self.raw(), timeout_ms, max_packets) })
    }

    fn loop_start(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_start)(self.raw()) })
    }

    fn loop_stop(&self, force: bool) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_stop)(self.raw(), force) })
    }

    fn loop_read(&self, max_packets: i32) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_read)(self.raw(), max_packets) })
    }

    fn loop_write(&self, max_packets: i32) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_write)(self.raw(), max_packets) })
    }

    fn loop_misc(&self) -> EngineResult<()> {
        self.status(unsafe { (self.api.loop_misc)(self.raw()) })
    }

    fn socket(&self) -> Option<i32> {
        let fd = unsafe { (self.api.socket)(self.raw()) };
        (fd >= 0).then_some(fd)
    }

    fn want_write(&self) -> bool {
        unsafe { (self.api.want_write)(self.raw()) }
    }
}

// ===== Factory =====

/// Creates [`MosquittoEngine`] handles from a loaded libmosquitto.
pub struct MosquittoFactory {
    api: Arc<MosquittoApi>,
}

static SHARED: Mutex<Option<EngineLibrary>> = parking_lot::const_mutex(None);

impl MosquittoFactory {
    /// Load the library named in `settings` and resolve its symbols.
    pub fn load(settings: &Settings) -> Result<Self, LoadError> {
        let mut loader = LibraryLoader::with_search_paths(&settings.search_paths);
        let library = loader.load(&settings.library)?;
        let api = MosquittoApi::load(library, &settings.library)?;
        tracing::debug!(library = %settings.library, "libmosquitto symbols resolved");
        Ok(Self { api: Arc::new(api) })
    }

    /// The process-wide libmosquitto library, loaded on first use.
    ///
    /// Later calls return the same library regardless of `settings`.
    pub fn shared(settings: &Settings) -> Result<EngineLibrary, LoadError> {
        let mut shared = SHARED.lock();
        if let Some(library) = shared.as_ref() {
            return Ok(library.clone());
        }
        let library = EngineLibrary::new(Arc::new(Self::load(settings)?));
        *shared = Some(library.clone());
        Ok(library)
    }
}

impl EngineFactory for MosquittoFactory {
    fn lib_init(&self) -> EngineResult<()> {
        EngineError::check(unsafe { (self.api.lib_init)() })
    }

    fn lib_cleanup(&self) {
        unsafe { (self.api.lib_cleanup)() };
    }

    fn lib_version(&self) -> LibVersion {
        let (mut major, mut minor, mut revision) = (0, 0, 0);
        unsafe { (self.api.lib_version)(&mut major, &mut minor, &mut revision) };
        LibVersion { major, minor, revision }
    }

    fn create(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<Box<dyn Engine>> {
        let id = c_string_opt(client_id)?;
        let raw = unsafe { (self.api.new)(opt_ptr(&id), clean_session, sink.as_user_data()) };
        let handle = NonNull::new(raw).ok_or_else(|| {
            EngineError::os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
        })?;

        let engine = MosquittoEngine {
            api: self.api.clone(),
            handle,
        };
        engine.install_callbacks();
        Ok(Box::new(engine))
    }

    fn topic_matches_sub(&self, pattern: &str, topic: &str) -> EngineResult<bool> {
        let pattern = c_string(pattern)?;
        let topic = c_string(topic)?;
        let mut result = false;
        EngineError::check(unsafe { (self.api.topic_matches_sub)(pattern.as_ptr(), topic.as_ptr(), &mut result) })?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_reports_load_error() {
        let settings = Settings {
            library: "mosquitto_definitely_missing_xyz".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            MosquittoFactory::load(&settings),
            Err(LoadError::LibraryNotFound(_))
        ));
    }

    #[test]
    fn test_payload_parts() {
        assert_eq!(payload_parts(None).unwrap().0, 0);
        assert!(payload_parts(Some(&[][..])).unwrap().1.is_null());
        assert_eq!(payload_parts(Some(&b"abc"[..])).unwrap().0, 3);
    }

    #[test]
    fn test_interior_nul_is_invalid() {
        assert_eq!(
            c_string("a\0b").unwrap_err(),
            EngineError::new(StatusCode::Inval)
        );
    }

    #[test]
    fn test_owned_bytes_handles_null() {
        let bytes = unsafe { owned_bytes(ptr::null(), 4) };
        assert!(bytes.is_empty());
        let data = [1u8, 2, 3];
        let bytes = unsafe { owned_bytes(data.as_ptr().cast(), 3) };
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
