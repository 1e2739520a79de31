//! The client userdata handed to scripts by `mosquitto.new`.

use std::sync::Arc;

use mlua::{Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use mosquitto_lua_config::Settings;
use parking_lot::Mutex;

use super::host::{LuaHandler, LuaHost};
use super::status::{bad_argument, push, push_ok, raise};
use crate::context::ClientContext;
use crate::engine::{EngineLibrary, ProtocolVersion, TlsFiles};
use crate::error::BridgeError;
use crate::event::EventKind;

type Payload = Option<mlua::String>;

pub struct LuaClient {
    ctx: ClientContext<LuaHost>,
    settings: Arc<Settings>,
    /// Host of the running background loop.
    background: Mutex<Option<LuaHost>>,
}

impl LuaClient {
    pub fn create(
        library: &EngineLibrary,
        settings: Arc<Settings>,
        client_id: Option<&str>,
        clean_session: bool,
    ) -> crate::error::Result<Self> {
        let ctx = ClientContext::create(library, client_id, clean_session)?;
        ctx.set_report_handler_errors(settings.report_handler_errors);
        Ok(Self {
            ctx,
            settings,
            background: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &ClientContext<LuaHost> {
        &self.ctx
    }

    fn take_background(&self) -> Option<LuaHost> {
        self.background.lock().take()
    }
}

impl Drop for LuaClient {
    fn drop(&mut self) {
        if let Some(host) = self.background.get_mut().take() {
            host.close();
        }
    }
}

fn bytes(payload: &Payload) -> Option<Vec<u8>> {
    payload.as_ref().map(|s| s.as_bytes().to_vec())
}

/// Accepts `"ON_MESSAGE"` or the constant's integer value.
fn event_kind(value: &Value) -> mlua::Result<EventKind> {
    let kind = match value {
        Value::String(name) => EventKind::from_name(&name.to_str()?),
        Value::Integer(code) => EventKind::from_code(*code),
        Value::Number(code) if code.fract() == 0.0 => EventKind::from_code(*code as i64),
        _ => None,
    };
    kind.ok_or_else(|| bad_argument(1, "unknown callback type"))
}

fn set_callback(lua: &Lua, this: &LuaClient, kind: EventKind, handler: Value) -> mlua::Result<()> {
    let Value::Function(function) = handler else {
        return Err(bad_argument(2, "expecting a callback function"));
    };
    let handler = LuaHandler::new(lua, function)?;
    this.ctx.set_handler(kind, handler).map_err(raise)
}

fn destroy(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    let result = this.ctx.destroy();
    if let Some(host) = this.take_background() {
        host.close();
    }
    push_ok(lua, result)
}

fn reinitialise(lua: &Lua, this: &LuaClient, (id, clean): (Option<String>, Option<bool>)) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.reinitialise(id.as_deref(), clean.unwrap_or(true)))
}

fn will_set(
    lua: &Lua,
    this: &LuaClient,
    (topic, payload, qos, retain): (String, Payload, Option<i32>, Option<bool>),
) -> mlua::Result<MultiValue> {
    let payload = bytes(&payload);
    push_ok(
        lua,
        this.ctx
            .will_set(&topic, payload.as_deref(), qos.unwrap_or(0), retain.unwrap_or(false)),
    )
}

fn will_clear(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.will_clear())
}

fn login_set(lua: &Lua, this: &LuaClient, (user, pass): (Option<String>, Option<String>)) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.login_set(user.as_deref(), pass.as_deref()))
}

fn tls_set(
    lua: &Lua,
    this: &LuaClient,
    (cafile, capath, certfile, keyfile): (Option<String>, Option<String>, Option<String>, Option<String>),
) -> mlua::Result<MultiValue> {
    let files = TlsFiles {
        cafile,
        capath,
        certfile,
        keyfile,
    };
    push_ok(lua, this.ctx.tls_set(&files))
}

fn tls_insecure_set(lua: &Lua, this: &LuaClient, insecure: bool) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.tls_insecure_set(insecure))
}

fn tls_opts_set(
    lua: &Lua,
    this: &LuaClient,
    (cert_reqs, version, ciphers): (Option<i32>, Option<String>, Option<String>),
) -> mlua::Result<MultiValue> {
    push_ok(
        lua,
        this.ctx
            .tls_opts_set(cert_reqs.unwrap_or(0), version.as_deref(), ciphers.as_deref()),
    )
}

fn tls_psk_set(
    lua: &Lua,
    this: &LuaClient,
    (psk, identity, ciphers): (String, String, Option<String>),
) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.tls_psk_set(&psk, &identity, ciphers.as_deref()))
}

fn threaded_set(lua: &Lua, this: &LuaClient, threaded: bool) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.threaded_set(threaded))
}

fn version_set(lua: &Lua, this: &LuaClient, name: Option<String>) -> mlua::Result<MultiValue> {
    let version = ProtocolVersion::from_name(name.as_deref()).map_err(raise)?;
    push_ok(lua, this.ctx.protocol_version_set(version))
}

type ConnectArgs = (Option<String>, Option<i32>, Option<i32>);

fn connect(lua: &Lua, this: &LuaClient, (host, port, keepalive): ConnectArgs) -> mlua::Result<MultiValue> {
    let host = host.unwrap_or_else(|| this.settings.host.clone());
    let port = port.unwrap_or(i32::from(this.settings.port));
    let keepalive = keepalive.unwrap_or(this.settings.keepalive);
    push_ok(lua, this.ctx.connect(&host, port, keepalive))
}

fn connect_async(lua: &Lua, this: &LuaClient, (host, port, keepalive): ConnectArgs) -> mlua::Result<MultiValue> {
    let host = host.unwrap_or_else(|| this.settings.host.clone());
    let port = port.unwrap_or(i32::from(this.settings.port));
    let keepalive = keepalive.unwrap_or(this.settings.keepalive);
    push_ok(lua, this.ctx.connect_async(&host, port, keepalive))
}

fn reconnect(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.reconnect())
}

fn reconnect_async(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.reconnect_async())
}

fn reconnect_delay_set(
    lua: &Lua,
    this: &LuaClient,
    (delay, delay_max, exponential): (Option<u32>, Option<u32>, Option<bool>),
) -> mlua::Result<MultiValue> {
    push_ok(
        lua,
        this.ctx.reconnect_delay_set(
            delay.unwrap_or(1),
            delay_max.unwrap_or(30),
            exponential.unwrap_or(true),
        ),
    )
}

fn disconnect(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.disconnect())
}

fn publish(
    lua: &Lua,
    this: &LuaClient,
    (topic, payload, qos, retain): (String, Payload, Option<i32>, Option<bool>),
) -> mlua::Result<MultiValue> {
    let payload = bytes(&payload);
    push(
        lua,
        this.ctx
            .publish(&topic, payload.as_deref(), qos.unwrap_or(0), retain.unwrap_or(false)),
    )
}

fn subscribe(lua: &Lua, this: &LuaClient, (pattern, qos): (String, Option<i32>)) -> mlua::Result<MultiValue> {
    push(lua, this.ctx.subscribe(&pattern, qos.unwrap_or(0)))
}

fn unsubscribe(lua: &Lua, this: &LuaClient, pattern: String) -> mlua::Result<MultiValue> {
    push(lua, this.ctx.unsubscribe(&pattern))
}

type LoopArgs = (Option<i32>, Option<i32>);

fn run_once(lua: &Lua, this: &LuaClient, (timeout, max_packets): LoopArgs) -> mlua::Result<MultiValue> {
    let timeout = timeout.unwrap_or(this.settings.loop_timeout_ms);
    let max_packets = max_packets.unwrap_or(this.settings.max_packets);
    push_ok(lua, this.ctx.driver().run_once(LuaHost::new(lua), timeout, max_packets))
}

fn run_forever(lua: &Lua, this: &LuaClient, (timeout, max_packets): LoopArgs) -> mlua::Result<MultiValue> {
    let timeout = timeout.unwrap_or(this.settings.loop_timeout_ms);
    let max_packets = max_packets.unwrap_or(this.settings.max_packets);
    push_ok(lua, this.ctx.driver().run_forever(LuaHost::new(lua), timeout, max_packets))
}

fn loop_start(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    let host = LuaHost::background(lua, this.settings.report_handler_errors)
        .map_err(|e| raise(BridgeError::Os(e)))?;
    let result = this.ctx.driver().start_background(host.clone());
    if result.is_ok() {
        *this.background.lock() = Some(host);
    } else {
        host.close();
    }
    push_ok(lua, result)
}

/// Handler calls the loop thread queued and the script has not run yet are
/// run here on a graceful stop, and dropped on a forced one.
fn loop_stop(lua: &Lua, this: &LuaClient, force: Option<bool>) -> mlua::Result<MultiValue> {
    let force = force.unwrap_or(false);
    let result = this.ctx.driver().stop_background(force);
    if result.is_ok() || force {
        if let Some(host) = this.take_background() {
            if !force {
                host.drain(lua);
            }
            host.close();
        }
    }
    push_ok(lua, result)
}

fn socket(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    let fd = this.ctx.socket().map(|fd| match fd {
        Some(fd) => Value::Integer(i64::from(fd)),
        None => Value::Boolean(false),
    });
    push(lua, fd)
}

fn loop_read(lua: &Lua, this: &LuaClient, max_packets: Option<i32>) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.driver().drive_read(LuaHost::new(lua), max_packets.unwrap_or(1)))
}

fn loop_write(lua: &Lua, this: &LuaClient, max_packets: Option<i32>) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.driver().drive_write(LuaHost::new(lua), max_packets.unwrap_or(1)))
}

fn loop_misc(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push_ok(lua, this.ctx.driver().drive_misc(LuaHost::new(lua)))
}

fn want_write(lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<MultiValue> {
    push(lua, this.ctx.want_write())
}

fn callback_set(lua: &Lua, this: &LuaClient, (kind, handler): (Value, Value)) -> mlua::Result<bool> {
    set_callback(lua, this, event_kind(&kind)?, handler)?;
    Ok(true)
}

/// `client.ON_MESSAGE = fn`
fn assign_callback(lua: &Lua, this: &LuaClient, (key, handler): (Value, Value)) -> mlua::Result<()> {
    let field = match &key {
        Value::String(name) => name.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    };
    match EventKind::from_name(&field) {
        Some(kind) => set_callback(lua, this, kind, handler),
        None => Err(raise(BridgeError::InvalidArgument(format!(
            "cannot assign field '{}' on a mosquitto client",
            field
        )))),
    }
}

fn describe(_lua: &Lua, this: &LuaClient, (): ()) -> mlua::Result<String> {
    Ok(if this.ctx.is_destroyed() {
        "mosquitto client (destroyed)".to_string()
    } else {
        format!("mosquitto client ({})", this.ctx.id())
    })
}

impl UserData for LuaClient {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("destroy", destroy);
        methods.add_method("reinitialise", reinitialise);
        methods.add_method("will_set", will_set);
        methods.add_method("will_clear", will_clear);
        methods.add_method("login_set", login_set);
        methods.add_method("tls_set", tls_set);
        methods.add_method("tls_insecure_set", tls_insecure_set);
        methods.add_method("tls_opts_set", tls_opts_set);
        methods.add_method("tls_psk_set", tls_psk_set);
        methods.add_method("threaded_set", threaded_set);
        methods.add_method("version_set", version_set);
        methods.add_method("connect", connect);
        methods.add_method("connect_async", connect_async);
        methods.add_method("reconnect", reconnect);
        methods.add_method("reconnect_async", reconnect_async);
        methods.add_method("reconnect_delay_set", reconnect_delay_set);
        methods.add_method("disconnect", disconnect);
        methods.add_method("publish", publish);
        methods.add_method("subscribe", subscribe);
        methods.add_method("unsubscribe", unsubscribe);
        methods.add_method("loop", run_once);
        methods.add_method("loop_forever", run_forever);
        methods.add_method("loop_start", loop_start);
        methods.add_method("loop_stop", loop_stop);
        methods.add_method("socket", socket);
        methods.add_method("loop_read", loop_read);
        methods.add_method("loop_write", loop_write);
        methods.add_method("loop_misc", loop_misc);
        methods.add_method("want_write", want_write);
        methods.add_method("callback_set", callback_set);

        #[cfg(feature = "compat")]
        {
            methods.add_method("set_will", will_set);
            methods.add_method("clear_will", will_clear);
            methods.add_method("set_login", login_set);
            methods.add_method("start_loop", loop_start);
            methods.add_method("stop_loop", loop_stop);
            methods.add_method("set_callback", callback_set);
            methods.add_method("read", loop_read);
            methods.add_method("write", loop_write);
            methods.add_method("misc", loop_misc);
        }

        methods.add_meta_method(MetaMethod::NewIndex, assign_callback);
        methods.add_meta_method(MetaMethod::ToString, describe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_lua_values() {
        let lua = Lua::new();
        let name = Value::String(lua.create_string("ON_LOG").unwrap());
        assert_eq!(event_kind(&name).unwrap(), EventKind::Log);
        assert_eq!(event_kind(&Value::Integer(0x01)).unwrap(), EventKind::Message);
        assert_eq!(event_kind(&Value::Number(128.0)).unwrap(), EventKind::Subscribe);

        let log_constant = Value::String(lua.create_string("LOG_DEBUG").unwrap());
        assert!(event_kind(&log_constant).is_err());
        assert!(event_kind(&Value::Integer(0x11)).is_err());
        assert!(event_kind(&Value::Boolean(true)).is_err());
    }

    #[test]
    fn test_missing_payload_is_none() {
        assert_eq!(bytes(&None), None);
    }
}
