//! Script-visible form of bridge results.

use mlua::{IntoLuaMulti, Lua, MultiValue, Value};

use crate::error::{BridgeError, Result};
use crate::reason::os_description;

/// Value on success, `nil, code, description` on a recoverable or OS-level
/// failure, and a raised error for everything else.
pub fn push<T: IntoLuaMulti>(lua: &Lua, result: Result<T>) -> mlua::Result<MultiValue> {
    match result {
        Ok(value) => value.into_lua_multi(lua),
        Err(BridgeError::Recoverable { code, description }) => {
            (Value::Nil, code, description).into_lua_multi(lua)
        }
        Err(BridgeError::Os(err)) => match err.raw_os_error() {
            Some(errno) => (Value::Nil, errno, os_description(errno)).into_lua_multi(lua),
            None => Err(raise(BridgeError::Os(err))),
        },
        Err(err) => Err(raise(err)),
    }
}

/// `true` on success.
pub fn push_ok(lua: &Lua, result: Result<()>) -> mlua::Result<MultiValue> {
    push(lua, result.map(|()| true))
}

pub fn raise(err: BridgeError) -> mlua::Error {
    mlua::Error::runtime(err.to_string())
}

pub fn bad_argument(position: usize, message: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::runtime(format!("bad argument #{} ({})", position, message))
}
