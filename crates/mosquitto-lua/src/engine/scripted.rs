//! An in-process engine with a loopback broker.
//!
//! Connects always reach the "broker"; every operation queues the events a real
//! broker would answer with, and published messages come back to matching
//! subscriptions of the same client. Nothing is raised until the engine is
//! driven, and the internal lock is never held while raising.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use super::topic;
use super::{Engine, EngineFactory, LibVersion, ProtocolVersion, TlsFiles};
use crate::bridge::{Dispatch, EventSink};
use crate::event::{log_level, EngineEvent};
use crate::reason::{EngineError, EngineResult, StatusCode};

const EINVAL: i32 = 22;
const TICK: Duration = Duration::from_millis(2);

const RUN: u8 = 0;
const DRAIN: u8 = 1;
const ABANDON: u8 = 2;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Last will registered on a scripted engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: i32,
    pub retain: bool,
}

struct Background {
    control: Arc<AtomicU8>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

struct Inner {
    client_id: String,
    clean_session: bool,
    connected: bool,
    broker: Option<(String, i32, i32)>,
    pending: VecDeque<EngineEvent>,
    subscriptions: Vec<(String, i32)>,
    retained: HashMap<String, (Vec<u8>, i32)>,
    next_mid: i32,
    fail_next: Option<EngineError>,
    will: Option<Will>,
    credentials: Option<(Option<String>, Option<String>)>,
    tls: Option<TlsFiles>,
    tls_insecure: bool,
    psk_identity: Option<String>,
    threaded: bool,
    protocol: ProtocolVersion,
    reconnect_delay: (u32, u32, bool),
}

impl Inner {
    fn new(serial: u64, client_id: Option<&str>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.map_or_else(|| format!("scripted-{}", serial), str::to_string),
            clean_session,
            connected: false,
            broker: None,
            pending: VecDeque::new(),
            subscriptions: Vec::new(),
            retained: HashMap::new(),
            next_mid: 0,
            fail_next: None,
            will: None,
            credentials: None,
            tls: None,
            tls_insecure: false,
            psk_identity: None,
            threaded: false,
            protocol: ProtocolVersion::V31,
            reconnect_delay: (1, 30, true),
        }
    }

    fn mid(&mut self) -> i32 {
        self.next_mid = if self.next_mid == u16::MAX as i32 { 1 } else { self.next_mid + 1 };
        self.next_mid
    }

    fn log(&mut self, message: String) {
        self.pending.push_back(EngineEvent::Log {
            level: log_level::DEBUG as i32,
            message,
        });
    }

    fn require_connection(&self) -> EngineResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(EngineError::new(StatusCode::NoConn))
        }
    }

    fn open_session(&mut self, connack: i32) {
        let id = self.client_id.clone();
        self.log(format!("Client {} sending CONNECT", id));
        self.log(format!("Client {} received CONNACK ({})", id, connack));
        self.pending.push_back(EngineEvent::Connect { rc: connack });
        if connack == 0 {
            self.connected = true;
        } else {
            self.connected = false;
            self.pending.push_back(EngineEvent::Disconnect {
                rc: StatusCode::ConnRefused.raw(),
            });
        }
    }

    fn deliver_to_subscribers(&mut self, topic: &str, payload: &[u8], qos: i32, retain: bool) {
        let granted = self
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic).unwrap_or(false))
            .map(|(_, sub_qos)| *sub_qos)
            .max();

        if let Some(sub_qos) = granted {
            let qos = qos.min(sub_qos);
            let mid = if qos == 0 { 0 } else { self.mid() };
            self.pending.push_back(EngineEvent::Message {
                mid,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
            });
        }
    }
}

struct ScriptedState {
    serial: u64,
    connack: i32,
    sink: Mutex<EventSink>,
    inner: Mutex<Inner>,
    background: Mutex<Option<Background>>,
}

impl ScriptedState {
    fn next_event(&self) -> Option<EngineEvent> {
        self.inner.lock().pending.pop_front()
    }

    fn raise(&self, event: EngineEvent) -> Dispatch {
        let sink = *self.sink.lock();
        sink.raise(event)
    }

    /// Deliver the events queued so far. Events queued by handlers during this
    /// call wait for the next one.
    fn drain(&self, limit: Option<usize>, abort: impl Fn() -> bool) -> usize {
        let queued = self.inner.lock().pending.len();
        let budget = limit.map_or(queued, |l| l.min(queued));
        let mut delivered = 0;
        while delivered < budget && !abort() {
            let Some(event) = self.next_event() else { break };
            self.raise(event);
            delivered += 1;
        }
        delivered
    }

    fn take_failure(&self) -> EngineResult<()> {
        match self.inner.lock().fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_idle_and_closed(&self) -> bool {
        let inner = self.inner.lock();
        !inner.connected && inner.pending.is_empty()
    }
}

fn background_loop(state: Weak<ScriptedState>, control: Arc<AtomicU8>) {
    loop {
        let mode = control.load(Ordering::Acquire);
        if mode == ABANDON {
            break;
        }
        let Some(state) = state.upgrade() else { break };
        let delivered = state.drain(None, || control.load(Ordering::Acquire) == ABANDON);
        if mode == DRAIN {
            break;
        }
        drop(state);
        if delivered == 0 {
            thread::sleep(TICK);
        }
    }
}

/// Handle to a scripted engine. Clones share state, so tests can keep one to
/// inspect and steer the engine a context owns.
#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<ScriptedState>,
}

impl ScriptedEngine {
    fn op<T>(&self, f: impl FnOnce(&mut Inner) -> EngineResult<T>) -> EngineResult<T> {
        let mut inner = self.state.inner.lock();
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        f(&mut inner)
    }

    /// Queue an event for the next driving call.
    pub fn inject(&self, event: EngineEvent) {
        self.state.inner.lock().pending.push_back(event);
    }

    /// Raise an event immediately on the calling thread, bypassing the queue.
    pub fn raise_now(&self, event: EngineEvent) -> Dispatch {
        self.state.raise(event)
    }

    /// Make the next operation fail with `code`.
    pub fn fail_next(&self, code: StatusCode) {
        self.state.inner.lock().fail_next = Some(EngineError::new(code));
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self, rc: i32) {
        let mut inner = self.state.inner.lock();
        inner.connected = false;
        inner.pending.push_back(EngineEvent::Disconnect { rc });
    }

    pub fn is_connected(&self) -> bool {
        self.state.inner.lock().connected
    }

    pub fn client_id(&self) -> String {
        self.state.inner.lock().client_id.clone()
    }

    pub fn clean_session(&self) -> bool {
        self.state.inner.lock().clean_session
    }

    pub fn pending_events(&self) -> usize {
        self.state.inner.lock().pending.len()
    }

    pub fn subscriptions(&self) -> Vec<(String, i32)> {
        self.state.inner.lock().subscriptions.clone()
    }

    pub fn will(&self) -> Option<Will> {
        self.state.inner.lock().will.clone()
    }

    pub fn credentials(&self) -> Option<(Option<String>, Option<String>)> {
        self.state.inner.lock().credentials.clone()
    }

    pub fn tls_files(&self) -> Option<TlsFiles> {
        self.state.inner.lock().tls.clone()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.state.inner.lock().protocol
    }

    pub fn reconnect_delay(&self) -> (u32, u32, bool) {
        self.state.inner.lock().reconnect_delay
    }

    pub fn background_running(&self) -> bool {
        self.state.background.lock().is_some()
    }

    fn connect_inner(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()> {
        let connack = self.state.connack;
        self.op(|inner| {
            if host.is_empty() || !(1..=65535).contains(&port) || keepalive < 0 {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.broker = Some((host.to_string(), port, keepalive));
            inner.open_session(connack);
            Ok(())
        })
    }

    fn reconnect_inner(&self) -> EngineResult<()> {
        let connack = self.state.connack;
        self.op(|inner| {
            if inner.broker.is_none() {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.open_session(connack);
            Ok(())
        })
    }
}

impl Engine for ScriptedEngine {
    fn reinitialise(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<()> {
        if client_id.is_none() && !clean_session {
            return Err(EngineError::new(StatusCode::Inval));
        }
        *self.state.inner.lock() = Inner::new(self.state.serial, client_id, clean_session);
        *self.state.sink.lock() = sink;
        Ok(())
    }

    fn will_set(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<()> {
        self.op(|inner| {
            if !topic::is_valid_topic(topic) || !(0..=2).contains(&qos) {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.will = Some(Will {
                topic: topic.to_string(),
                payload: payload.unwrap_or_default().to_vec(),
                qos,
                retain,
            });
            Ok(())
        })
    }

    fn will_clear(&self) -> EngineResult<()> {
        self.op(|inner| {
            inner.will = None;
            Ok(())
        })
    }

    fn login_set(&self, username: Option<&str>, password: Option<&str>) -> EngineResult<()> {
        self.op(|inner| {
            if username.is_none() && password.is_some() {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.credentials = username.map(|u| (Some(u.to_string()), password.map(str::to_string)));
            Ok(())
        })
    }

    fn tls_set(&self, files: &TlsFiles) -> EngineResult<()> {
        self.op(|inner| {
            if files.cafile.is_none() && files.capath.is_none() {
                return Err(EngineError::new(StatusCode::Inval));
            }
            if files.certfile.is_some() != files.keyfile.is_some() {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.tls = Some(files.clone());
            Ok(())
        })
    }

    fn tls_insecure_set(&self, insecure: bool) -> EngineResult<()> {
        self.op(|inner| {
            inner.tls_insecure = insecure;
            Ok(())
        })
    }

    fn tls_opts_set(&self, cert_reqs: i32, tls_version: Option<&str>, _ciphers: Option<&str>) -> EngineResult<()> {
        self.op(|_| {
            let version_ok = matches!(tls_version, None | Some("tlsv1") | Some("tlsv1.1") | Some("tlsv1.2") | Some("tlsv1.3"));
            if !(0..=1).contains(&cert_reqs) || !version_ok {
                return Err(EngineError::new(StatusCode::Inval));
            }
            Ok(())
        })
    }

    fn tls_psk_set(&self, psk: &str, identity: &str, _ciphers: Option<&str>) -> EngineResult<()> {
        self.op(|inner| {
            if psk.is_empty() || !psk.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.psk_identity = Some(identity.to_string());
            Ok(())
        })
    }

    fn threaded_set(&self, threaded: bool) -> EngineResult<()> {
        self.op(|inner| {
            inner.threaded = threaded;
            Ok(())
        })
    }

    fn protocol_version_set(&self, version: ProtocolVersion) -> EngineResult<()> {
        self.op(|inner| {
            inner.protocol = version;
            Ok(())
        })
    }

    fn connect(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()> {
        self.connect_inner(host, port, keepalive)
    }

    fn connect_async(&self, host: &str, port: i32, keepalive: i32) -> EngineResult<()> {
        self.connect_inner(host, port, keepalive)
    }

    fn reconnect(&self) -> EngineResult<()> {
        self.reconnect_inner()
    }

    fn reconnect_async(&self) -> EngineResult<()> {
        self.reconnect_inner()
    }

    fn reconnect_delay_set(&self, delay: u32, delay_max: u32, exponential: bool) -> EngineResult<()> {
        self.op(|inner| {
            inner.reconnect_delay = (delay, delay_max, exponential);
            Ok(())
        })
    }

    fn disconnect(&self) -> EngineResult<()> {
        self.op(|inner| {
            inner.require_connection()?;
            let id = inner.client_id.clone();
            inner.log(format!("Client {} sending DISCONNECT", id));
            inner.connected = false;
            inner.pending.push_back(EngineEvent::Disconnect { rc: 0 });
            Ok(())
        })
    }

    fn publish(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> EngineResult<i32> {
        self.op(|inner| {
            if !topic::is_valid_topic(topic) || !(0..=2).contains(&qos) {
                return Err(EngineError::new(StatusCode::Inval));
            }
            let payload = payload.unwrap_or_default();
            if payload.len() > 268_435_455 {
                return Err(EngineError::new(StatusCode::PayloadSize));
            }
            inner.require_connection()?;

            let mid = inner.mid();
            let id = inner.client_id.clone();
            inner.log(format!(
                "Client {} sending PUBLISH (d0, q{}, r{}, m{}, '{}', ... ({} bytes))",
                id,
                qos,
                i32::from(retain),
                mid,
                topic,
                payload.len()
            ));
            inner.pending.push_back(EngineEvent::Publish { mid });

            if retain {
                if payload.is_empty() {
                    inner.retained.remove(topic);
                } else {
                    inner.retained.insert(topic.to_string(), (payload.to_vec(), qos));
                }
            }
            inner.deliver_to_subscribers(topic, payload, qos, false);
            Ok(mid)
        })
    }

    fn subscribe(&self, pattern: &str, qos: i32) -> EngineResult<i32> {
        self.op(|inner| {
            if !topic::is_valid_filter(pattern) || !(0..=2).contains(&qos) {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.require_connection()?;

            let mid = inner.mid();
            let id = inner.client_id.clone();
            inner.log(format!(
                "Client {} sending SUBSCRIBE (Mid: {}, Topic: {}, QoS: {})",
                id, mid, pattern, qos
            ));
            inner.subscriptions.retain(|(existing, _)| existing != pattern);
            inner.subscriptions.push((pattern.to_string(), qos));
            inner.pending.push_back(EngineEvent::Subscribe {
                mid,
                granted_qos: vec![qos],
            });

            let mut retained: Vec<(String, Vec<u8>, i32)> = inner
                .retained
                .iter()
                .filter(|(topic, _)| topic::matches(pattern, topic).unwrap_or(false))
                .map(|(topic, (payload, retained_qos))| (topic.clone(), payload.clone(), *retained_qos))
                .collect();
            retained.sort();
            for (topic, payload, retained_qos) in retained {
                let qos = retained_qos.min(qos);
                let mid = if qos == 0 { 0 } else { inner.mid() };
                inner.pending.push_back(EngineEvent::Message {
                    mid,
                    topic,
                    payload,
                    qos,
                    retain: true,
                });
            }
            Ok(mid)
        })
    }

    fn unsubscribe(&self, pattern: &str) -> EngineResult<i32> {
        self.op(|inner| {
            if !topic::is_valid_filter(pattern) {
                return Err(EngineError::new(StatusCode::Inval));
            }
            inner.require_connection()?;

            let mid = inner.mid();
            inner.subscriptions.retain(|(existing, _)| existing != pattern);
            inner.pending.push_back(EngineEvent::Unsubscribe { mid });
            Ok(mid)
        })
    }

    fn loop_iterate(&self, _timeout_ms: i32, _max_packets: i32) -> EngineResult<()> {
        self.state.take_failure()?;
        if self.state.is_idle_and_closed() {
            return Err(EngineError::new(StatusCode::NoConn));
        }
        self.state.drain(None, || false);
        Ok(())
    }

    fn loop_forever(&self, timeout_ms: i32, _max_packets: i32) -> EngineResult<()> {
        self.state.take_failure()?;
        if self.state.is_idle_and_closed() {
            return Err(EngineError::new(StatusCode::NoConn));
        }

        let idle = match u64::try_from(timeout_ms) {
            Ok(ms) => Duration::from_millis(ms).clamp(Duration::from_millis(1), TICK),
            Err(_) => TICK,
        };
        loop {
            let delivered = self.state.drain(None, || false);
            if self.state.is_idle_and_closed() {
                return Ok(());
            }
            if delivered == 0 {
                thread::sleep(idle);
            }
        }
    }

    fn loop_start(&self) -> EngineResult<()> {
        self.state.take_failure()?;
        let mut background = self.state.background.lock();
        if background.is_some() {
            return Err(EngineError::new(StatusCode::Inval));
        }

        let control = Arc::new(AtomicU8::new(RUN));
        let weak = Arc::downgrade(&self.state);
        let thread_control = control.clone();
        let thread = thread::Builder::new()
            .name(format!("scripted-loop-{}", self.state.serial))
            .spawn(move || background_loop(weak, thread_control))
            .map_err(|e| EngineError::os(e.raw_os_error().unwrap_or(EINVAL)))?;

        let thread_id = thread.thread().id();
        *background = Some(Background {
            control,
            thread,
            thread_id,
        });
        Ok(())
    }

    fn loop_stop(&self, force: bool) -> EngineResult<()> {
        let mut slot = self.state.background.lock();
        let Some(background) = slot.as_ref() else {
            return Err(EngineError::new(StatusCode::Inval));
        };
        // Joining from the loop thread itself would never return.
        if !force && background.thread_id == thread::current().id() {
            return Err(EngineError::new(StatusCode::Inval));
        }

        let Some(background) = slot.take() else {
            return Err(EngineError::new(StatusCode::Inval));
        };
        drop(slot);

        if force {
            background.control.store(ABANDON, Ordering::Release);
            // Detached: in-flight handlers finish on their own.
            drop(background.thread);
        } else {
            background.control.store(DRAIN, Ordering::Release);
            if background.thread.join().is_err() {
                return Err(EngineError::new(StatusCode::Unknown));
            }
        }
        Ok(())
    }

    fn loop_read(&self, max_packets: i32) -> EngineResult<()> {
        self.state.take_failure()?;
        if self.state.is_idle_and_closed() {
            return Err(EngineError::new(StatusCode::NoConn));
        }
        let limit = usize::try_from(max_packets).ok().filter(|n| *n > 0);
        self.state.drain(limit, || false);
        Ok(())
    }

    fn loop_write(&self, _max_packets: i32) -> EngineResult<()> {
        self.op(|inner| inner.require_connection())
    }

    fn loop_misc(&self) -> EngineResult<()> {
        self.op(|inner| inner.require_connection())
    }

    fn socket(&self) -> Option<i32> {
        let connected = self.state.inner.lock().connected;
        connected.then(|| 100 + (self.state.serial % 1000) as i32)
    }

    fn want_write(&self) -> bool {
        false
    }
}

impl Drop for ScriptedState {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            background.control.store(ABANDON, Ordering::Release);
        }
    }
}

/// Factory for [`ScriptedEngine`]s.
pub struct ScriptedFactory {
    connack: AtomicI32,
    init_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    engines: Mutex<Vec<Weak<ScriptedState>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::with_connack(0)
    }

    /// Every connect is answered with `code`.
    pub fn with_connack(code: i32) -> Self {
        Self {
            connack: AtomicI32::new(code),
            init_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Applies to engines created afterwards.
    pub fn set_connack(&self, code: i32) {
        self.connack.store(code, Ordering::Relaxed);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Relaxed)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::Relaxed)
    }

    /// The most recently created engine still alive.
    pub fn last_engine(&self) -> Option<ScriptedEngine> {
        self.engines
            .lock()
            .iter()
            .rev()
            .find_map(Weak::upgrade)
            .map(|state| ScriptedEngine { state })
    }

    /// Number of created engines that have not been freed.
    pub fn live_engines(&self) -> usize {
        self.engines
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for ScriptedFactory {
    fn lib_init(&self) -> EngineResult<()> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn lib_cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn lib_version(&self) -> LibVersion {
        LibVersion {
            major: 2,
            minor: 0,
            revision: 18,
        }
    }

    fn create(&self, client_id: Option<&str>, clean_session: bool, sink: EventSink) -> EngineResult<Box<dyn Engine>> {
        if client_id.is_some_and(str::is_empty) || (client_id.is_none() && !clean_session) {
            return Err(EngineError::os(EINVAL));
        }

        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ScriptedState {
            serial,
            connack: self.connack.load(Ordering::Relaxed),
            sink: Mutex::new(sink),
            inner: Mutex::new(Inner::new(serial, client_id, clean_session)),
            background: Mutex::new(None),
        });

        let mut engines = self.engines.lock();
        engines.retain(|weak| weak.strong_count() > 0);
        engines.push(Arc::downgrade(&state));

        Ok(Box::new(ScriptedEngine { state }))
    }

    fn topic_matches_sub(&self, pattern: &str, topic: &str) -> EngineResult<bool> {
        topic::matches(pattern, topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ContextId;

    fn engine() -> (Box<dyn Engine>, ScriptedEngine) {
        let factory = ScriptedFactory::new();
        let sink = EventSink::new(ContextId::next());
        let boxed = factory.create(Some("unit"), true, sink).unwrap();
        let control = factory.last_engine().unwrap();
        (boxed, control)
    }

    #[test]
    fn test_engine_freed_with_box() {
        let factory = ScriptedFactory::new();
        let boxed = factory
            .create(None, true, EventSink::new(ContextId::next()))
            .unwrap();
        assert_eq!(factory.live_engines(), 1);
        drop(boxed);
        assert_eq!(factory.live_engines(), 0);
    }

    #[test]
    fn test_operations_require_connection() {
        let factory = ScriptedFactory::new();
        let boxed = factory
            .create(Some("c"), true, EventSink::new(ContextId::next()))
            .unwrap();
        assert_eq!(
            boxed.publish("a/b", None, 0, false),
            Err(EngineError::new(StatusCode::NoConn))
        );
        assert_eq!(
            boxed.loop_iterate(0, 1),
            Err(EngineError::new(StatusCode::NoConn))
        );
    }

    #[test]
    fn test_publish_loops_back_to_subscription() {
        let factory = ScriptedFactory::new();
        let boxed = factory
            .create(Some("c"), true, EventSink::new(ContextId::next()))
            .unwrap();
        let control = factory.last_engine().unwrap();

        boxed.connect("localhost", 1883, 60).unwrap();
        boxed.subscribe("sensors/+", 1).unwrap();
        let before = control.pending_events();
        let mid = boxed.publish("sensors/t1", Some(b"21.5"), 2, false).unwrap();
        assert!(mid > 0);
        // log, PUBACK, and the looped-back message
        assert_eq!(control.pending_events(), before + 3);
    }

    #[test]
    fn test_fail_next_applies_once() {
        let (_engine, control) = engine();
        control.fail_next(StatusCode::ConnLost);
        assert_eq!(
            control.connect("h", 1883, 60),
            Err(EngineError::new(StatusCode::ConnLost))
        );
        assert!(control.connect("h", 1883, 60).is_ok());
        assert!(control.is_connected());
    }

    #[test]
    fn test_refused_connack_leaves_disconnected() {
        let factory = ScriptedFactory::with_connack(5);
        let boxed = factory
            .create(Some("c"), true, EventSink::new(ContextId::next()))
            .unwrap();
        let control = factory.last_engine().unwrap();

        boxed.connect("localhost", 1883, 60).unwrap();
        assert!(!control.is_connected());
        let events: Vec<EngineEvent> = std::iter::from_fn(|| control.state.next_event()).collect();
        assert!(events.contains(&EngineEvent::Connect { rc: 5 }));
        assert_eq!(events.last(), Some(&EngineEvent::Disconnect { rc: 5 }));
    }

    #[test]
    fn test_invalid_arguments() {
        let (_engine, control) = engine();
        control.connect("h", 1883, 60).unwrap();
        assert_eq!(
            control.subscribe("a/#/b", 0),
            Err(EngineError::new(StatusCode::Inval))
        );
        assert_eq!(
            control.publish("a/+", None, 0, false),
            Err(EngineError::new(StatusCode::Inval))
        );
        assert_eq!(
            control.publish("a", None, 3, false),
            Err(EngineError::new(StatusCode::Inval))
        );
        assert_eq!(
            control.connect("h", 0, 60),
            Err(EngineError::new(StatusCode::Inval))
        );
    }

    #[test]
    fn test_retained_message_replayed_on_subscribe() {
        let (_engine, control) = engine();
        control.connect("h", 1883, 60).unwrap();
        control.publish("status", Some(b"online"), 1, true).unwrap();

        while control.state.next_event().is_some() {}
        control.subscribe("status", 0).unwrap();

        let events: Vec<EngineEvent> = std::iter::from_fn(|| control.state.next_event()).collect();
        assert!(events.contains(&EngineEvent::Message {
            mid: 0,
            topic: "status".to_string(),
            payload: b"online".to_vec(),
            qos: 0,
            retain: true,
        }));
    }

    #[test]
    fn test_loop_stop_without_thread() {
        let (_engine, control) = engine();
        assert_eq!(
            control.loop_stop(false),
            Err(EngineError::new(StatusCode::Inval))
        );
    }
}
