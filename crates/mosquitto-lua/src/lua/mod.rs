//! The `mosquitto` Lua module.
//!
//! [`open`] builds the module table over any [`EngineLibrary`]; [`open_default`]
//! loads configuration and libmosquitto the way `require("mosquitto")` does.

pub mod client;
pub mod host;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use mlua::{Lua, Table};
use mosquitto_lua_config::{ConfigLoader, Settings};
use parking_lot::Mutex;

use crate::engine::mosquitto::MosquittoFactory;
use crate::engine::{EngineLibrary, LibraryUse};
use crate::error::BridgeError;
use crate::event::{log_level, EventKind};

pub use client::LuaClient;
pub use host::{LuaHandler, LuaHost};

struct ModuleState {
    library: EngineLibrary,
    settings: Arc<Settings>,
    library_use: Mutex<Option<LibraryUse>>,
}

impl ModuleState {
    fn init(&self) -> crate::error::Result<()> {
        let mut slot = self.library_use.lock();
        if slot.is_none() {
            *slot = Some(self.library.acquire()?);
        }
        Ok(())
    }

    fn cleanup(&self) {
        let released = self.library_use.lock().take();
        drop(released);
    }
}

/// Build the module table. The module holds one library use until `cleanup`.
pub fn open(lua: &Lua, library: EngineLibrary, settings: Settings) -> mlua::Result<Table> {
    let state = Arc::new(ModuleState {
        library,
        settings: Arc::new(settings),
        library_use: Mutex::new(None),
    });
    state.init().map_err(status::raise)?;

    let module = lua.create_table()?;

    let s = state.clone();
    module.set(
        "version",
        lua.create_function(move |_, ()| Ok(s.library.version().to_string()))?,
    )?;

    let s = state.clone();
    module.set(
        "init",
        lua.create_function(move |lua, ()| status::push_ok(lua, s.init()))?,
    )?;

    let s = state.clone();
    module.set(
        "cleanup",
        lua.create_function(move |_, ()| {
            s.cleanup();
            Ok(true)
        })?,
    )?;

    let s = state.clone();
    module.set(
        "topic_matches_sub",
        lua.create_function(move |lua, (sub, topic): (String, String)| {
            status::push(lua, s.library.topic_matches_sub(&sub, &topic))
        })?,
    )?;

    let s = state;
    module.set(
        "new",
        lua.create_function(move |lua, (id, clean): (Option<String>, Option<bool>)| {
            let client = LuaClient::create(&s.library, s.settings.clone(), id.as_deref(), clean.unwrap_or(true));
            status::push(lua, client)
        })?,
    )?;

    for kind in EventKind::ALL {
        module.set(kind.name(), kind.code())?;
    }
    for (name, value) in log_level::NAMES {
        module.set(name, value)?;
    }

    Ok(module)
}

/// Settings from the configuration files around the working directory.
pub fn load_settings() -> crate::error::Result<Settings> {
    let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = ConfigLoader::new().load_from_directory(&start)?;
    Ok(config.settings())
}

/// Open the module against libmosquitto, configured from the environment.
pub fn open_default(lua: &Lua) -> mlua::Result<Table> {
    let settings = load_settings().map_err(status::raise)?;
    crate::logging::init(&settings.log_level);

    let library = MosquittoFactory::shared(&settings)
        .map_err(|e| status::raise(BridgeError::Library(e)))?;
    open(lua, library, settings)
}

#[cfg(feature = "module")]
#[mlua::lua_module(name = "mosquitto")]
fn luaopen(lua: &Lua) -> mlua::Result<Table> {
    open_default(lua)
}
