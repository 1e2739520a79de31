//! Shared helpers for bridge tests
//!
//! A recording host runtime, scriptable handlers, and contexts wired to the
//! in-process scripted engine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mosquitto_lua::engine::scripted::{ScriptedEngine, ScriptedFactory};
use mosquitto_lua::{ClientContext, EngineLibrary, HostArg, HostError, HostRuntime};
use parking_lot::Mutex;

/// One handler call as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub handler: String,
    pub args: Vec<HostArg>,
    pub thread: String,
}

pub type Hook = Box<dyn Fn(&[HostArg]) + Send + Sync>;

pub enum Behaviour {
    Record,
    /// Record, then report a handler error.
    Fail(String),
    /// Record, then panic inside the runtime.
    Panic(String),
    /// Record, then run arbitrary code (typically calling back into the client).
    Hook(Hook),
}

pub struct TestHandler {
    pub name: String,
    pub behaviour: Behaviour,
}

impl TestHandler {
    pub fn record(name: &str) -> Self {
        Self {
            name: name.to_string(),
            behaviour: Behaviour::Record,
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            behaviour: Behaviour::Fail(message.to_string()),
        }
    }

    pub fn panicking(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            behaviour: Behaviour::Panic(message.to_string()),
        }
    }

    pub fn hook(name: &str, hook: impl Fn(&[HostArg]) + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            behaviour: Behaviour::Hook(Box::new(hook)),
        }
    }
}

/// Host runtime that records every invocation.
#[derive(Clone, Default)]
pub struct RecordingHost {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, handler: &str) -> Vec<Vec<HostArg>> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.handler == handler)
            .map(|call| call.args.clone())
            .collect()
    }

    pub fn count(&self, handler: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.handler == handler).count()
    }

    /// Poll until `handler` has been called `n` times or `timeout` passes.
    pub fn wait_for(&self, handler: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count(handler) >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.count(handler) >= n
    }
}

impl HostRuntime for RecordingHost {
    type Handler = TestHandler;

    fn invoke(&self, handler: &TestHandler, args: &[HostArg]) -> Result<(), HostError> {
        self.calls.lock().push(Call {
            handler: handler.name.clone(),
            args: args.to_vec(),
            thread: std::thread::current().name().unwrap_or("unnamed").to_string(),
        });

        match &handler.behaviour {
            Behaviour::Record => Ok(()),
            Behaviour::Fail(message) => Err(HostError(message.clone())),
            Behaviour::Panic(message) => panic!("{}", message),
            Behaviour::Hook(hook) => {
                hook(args);
                Ok(())
            }
        }
    }
}

/// A context on a fresh scripted engine, plus handles to steer it.
pub struct Harness {
    pub factory: Arc<ScriptedFactory>,
    pub library: EngineLibrary,
    pub ctx: Arc<ClientContext<RecordingHost>>,
    pub engine: ScriptedEngine,
    pub host: RecordingHost,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(ScriptedFactory::new())
    }

    pub fn with_factory(factory: ScriptedFactory) -> Self {
        let factory = Arc::new(factory);
        let library = EngineLibrary::new(factory.clone());
        let ctx = ClientContext::create(&library, Some("harness"), true).expect("create context");
        let engine = factory.last_engine().expect("scripted engine");
        Self {
            factory,
            library,
            ctx: Arc::new(ctx),
            engine,
            host: RecordingHost::new(),
        }
    }

    /// Connect and deliver the CONNACK.
    pub fn connected() -> Self {
        let harness = Self::new();
        harness.ctx.connect("localhost", 1883, 60).expect("connect");
        harness.pump();
        harness
    }

    /// One foreground iteration on the harness host.
    pub fn pump(&self) {
        self.ctx
            .driver()
            .run_once(self.host.clone(), 0, 1)
            .expect("loop iteration");
    }
}

pub fn int(value: i64) -> HostArg {
    HostArg::Int(value)
}

pub fn text(value: &str) -> HostArg {
    HostArg::Str(value.to_string())
}

pub fn bytes(value: &[u8]) -> HostArg {
    HostArg::Bytes(value.to_vec())
}
