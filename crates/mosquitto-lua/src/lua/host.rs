//! Lua as a [`HostRuntime`].
//!
//! A foreground host calls handlers directly: the driving thread is already
//! inside Lua. A background host never touches the Lua state from the engine
//! thread. It posts each call to a [`Mailbox`], and a dispatcher thread runs
//! the queue whenever the state is free. The owning client drains or discards
//! what is left when the loop stops.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mlua::{Function, Lua, MultiValue, RegistryKey, Value, WeakLua};
use parking_lot::{Condvar, Mutex};

use crate::event::HostArg;
use crate::guarded;
use crate::host::{HostError, HostRuntime};

/// How often an idle dispatcher checks that the Lua state still exists.
const IDLE: Duration = Duration::from_millis(100);

/// A handler function pinned in the Lua registry.
#[derive(Clone)]
pub struct LuaHandler(Arc<RegistryKey>);

impl LuaHandler {
    pub fn new(lua: &Lua, function: Function) -> mlua::Result<Self> {
        Ok(Self(Arc::new(lua.create_registry_value(function)?)))
    }
}

fn to_values(lua: &Lua, args: &[HostArg]) -> mlua::Result<MultiValue> {
    let values = args
        .iter()
        .map(|arg| {
            Ok(match arg {
                HostArg::Bool(b) => Value::Boolean(*b),
                HostArg::Int(i) => Value::Integer(*i),
                HostArg::Str(s) => Value::String(lua.create_string(s)?),
                HostArg::Bytes(bytes) => Value::String(lua.create_string(bytes)?),
            })
        })
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}

fn call(lua: &Lua, handler: &LuaHandler, args: &[HostArg]) -> mlua::Result<()> {
    let function: Function = lua.registry_value(&handler.0)?;
    function.call::<()>(to_values(lua, args)?)
}

struct Job {
    handler: LuaHandler,
    args: Vec<HostArg>,
}

struct Queue {
    jobs: VecDeque<Job>,
    closed: bool,
}

enum Wake {
    Work,
    Idle,
    Closed,
}

/// Handler calls raised on an engine thread, waiting for the Lua state.
pub(crate) struct Mailbox {
    queue: Mutex<Queue>,
    ready: Condvar,
    report_failures: bool,
}

impl Mailbox {
    fn new(report_failures: bool) -> Self {
        Self {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            report_failures,
        }
    }

    /// Queue a call. Refused once the mailbox is closed.
    fn post(&self, job: Job) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }
        queue.jobs.push_back(job);
        self.ready.notify_one();
        true
    }

    fn wait(&self, timeout: Duration) -> Wake {
        let mut queue = self.queue.lock();
        if queue.jobs.is_empty() && !queue.closed {
            self.ready.wait_for(&mut queue, timeout);
        }
        if queue.closed {
            Wake::Closed
        } else if queue.jobs.is_empty() {
            Wake::Idle
        } else {
            Wake::Work
        }
    }

    fn pending(&self) -> usize {
        self.queue.lock().jobs.len()
    }

    /// Run queued calls in order. The caller must be inside the Lua state, so
    /// only one thread drains at a time.
    fn run_pending(&self, lua: &Lua) {
        loop {
            let Some(job) = self.queue.lock().jobs.pop_front() else {
                break;
            };
            let outcome = guarded::contain("lua handler", || call(lua, &job.handler, &job.args));
            if let Some(Err(err)) = outcome {
                if self.report_failures {
                    tracing::warn!(error = %err, "handler failed");
                }
            }
        }
    }

    fn close(&self) -> usize {
        let mut queue = self.queue.lock();
        queue.closed = true;
        let dropped = queue.jobs.len();
        queue.jobs.clear();
        self.ready.notify_all();
        dropped
    }
}

fn dispatch_loop(lua: WeakLua, mailbox: Arc<Mailbox>) {
    loop {
        match mailbox.wait(IDLE) {
            Wake::Closed => break,
            Wake::Idle => {
                if lua.try_upgrade().is_none() {
                    break;
                }
            }
            Wake::Work => {
                let Some(lua) = lua.try_upgrade() else { break };
                let queued = mailbox.clone();
                // Calling through Lua holds the state for the whole drain.
                let pump = lua.create_function(move |lua, ()| {
                    queued.run_pending(lua);
                    Ok(())
                });
                if let Err(err) = pump.and_then(|pump| pump.call::<()>(())) {
                    tracing::error!(error = %err, "background dispatch failed");
                    mailbox.close();
                    break;
                }
            }
        }
    }
    tracing::trace!("background dispatcher exited");
}

/// The Lua state a client is driven from.
///
/// Holds the state weakly: a client that outlives its script does not keep
/// the state alive.
#[derive(Clone)]
pub struct LuaHost {
    lua: WeakLua,
    mailbox: Option<Arc<Mailbox>>,
}

impl LuaHost {
    /// Runs handlers on the calling thread.
    pub fn new(lua: &Lua) -> Self {
        Self {
            lua: lua.weak(),
            mailbox: None,
        }
    }

    /// Posts handler calls to a dispatcher thread.
    pub fn background(lua: &Lua, report_failures: bool) -> io::Result<Self> {
        let mailbox = Arc::new(Mailbox::new(report_failures));
        let weak = lua.weak();
        let queued = mailbox.clone();
        thread::Builder::new()
            .name("mosquitto-lua-dispatch".to_string())
            .spawn(move || dispatch_loop(weak, queued))?;
        Ok(Self {
            lua: lua.weak(),
            mailbox: Some(mailbox),
        })
    }

    /// Calls waiting for the Lua state.
    pub fn pending(&self) -> usize {
        self.mailbox.as_ref().map_or(0, |m| m.pending())
    }

    /// Run every waiting call on this thread, which must be inside `lua`.
    pub fn drain(&self, lua: &Lua) {
        if let Some(mailbox) = &self.mailbox {
            mailbox.run_pending(lua);
        }
    }

    /// Stop the dispatcher. Calls still waiting are dropped.
    pub fn close(&self) {
        if let Some(mailbox) = &self.mailbox {
            let dropped = mailbox.close();
            if dropped > 0 {
                tracing::debug!(dropped, "pending handler calls discarded");
            }
        }
    }
}

impl HostRuntime for LuaHost {
    type Handler = LuaHandler;

    fn invoke(&self, handler: &LuaHandler, args: &[HostArg]) -> Result<(), HostError> {
        if let Some(mailbox) = &self.mailbox {
            let job = Job {
                handler: handler.clone(),
                args: args.to_vec(),
            };
            if !mailbox.post(job) {
                tracing::trace!("handler call after loop stop dropped");
            }
            return Ok(());
        }

        let lua = self
            .lua
            .try_upgrade()
            .ok_or_else(|| HostError("Lua state is closed".to_string()))?;
        call(&lua, handler, args).map_err(|e| HostError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(lua: &Lua) -> LuaHandler {
        lua.load("calls = 0").exec().unwrap();
        let function: Function = lua
            .load("return function(n) calls = calls + (n or 1) end")
            .eval()
            .unwrap();
        LuaHandler::new(lua, function).unwrap()
    }

    #[test]
    fn test_direct_invoke() {
        let lua = Lua::new();
        let handler = counter(&lua);
        let host = LuaHost::new(&lua);

        host.invoke(&handler, &[HostArg::Int(3)]).unwrap();
        assert_eq!(lua.globals().get::<i64>("calls").unwrap(), 3);
    }

    #[test]
    fn test_direct_invoke_after_state_closed() {
        let lua = Lua::new();
        let handler = counter(&lua);
        let host = LuaHost::new(&lua);
        drop(lua);

        assert!(host.invoke(&handler, &[]).is_err());
    }

    #[test]
    fn test_background_drain_and_close() {
        let lua = Lua::new();
        let handler = counter(&lua);
        let host = LuaHost::background(&lua, false).unwrap();

        // This thread stays inside Lua, so nothing runs until it drains.
        lua.create_function(move |lua, ()| {
            host.invoke(&handler, &[HostArg::Int(1)]).unwrap();
            host.invoke(&handler, &[HostArg::Int(2)]).unwrap();
            assert_eq!(host.pending(), 2);
            host.drain(lua);
            assert_eq!(host.pending(), 0);
            host.invoke(&handler, &[HostArg::Int(4)]).unwrap();
            host.close();
            host.invoke(&handler, &[HostArg::Int(8)]).unwrap();
            assert_eq!(host.pending(), 0);
            Ok(())
        })
        .unwrap()
        .call::<()>(())
        .unwrap();

        assert_eq!(lua.globals().get::<i64>("calls").unwrap(), 3);
    }
}
