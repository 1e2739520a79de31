//! Event kinds and the argument lists handlers receive.

use std::fmt;

use crate::reason::{translate_connect, translate_disconnect};

/// The closed set of events a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Connect,
    Disconnect,
    Publish,
    Message,
    Subscribe,
    Unsubscribe,
    Log,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Publish,
        EventKind::Message,
        EventKind::Subscribe,
        EventKind::Unsubscribe,
        EventKind::Log,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Script-visible constant name.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Connect => "ON_CONNECT",
            EventKind::Disconnect => "ON_DISCONNECT",
            EventKind::Publish => "ON_PUBLISH",
            EventKind::Message => "ON_MESSAGE",
            EventKind::Subscribe => "ON_SUBSCRIBE",
            EventKind::Unsubscribe => "ON_UNSUBSCRIBE",
            EventKind::Log => "ON_LOG",
        }
    }

    /// Script-visible constant value.
    pub fn code(self) -> i64 {
        match self {
            EventKind::Connect => 0x10,
            EventKind::Disconnect => 0xE0,
            EventKind::Publish => 0x30,
            EventKind::Message => 0x01,
            EventKind::Subscribe => 0x80,
            EventKind::Unsubscribe => 0xA0,
            EventKind::Log => 0x02,
        }
    }

    /// Resolve a constant name. Only names carrying the `ON_` prefix are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        if !name.starts_with("ON_") {
            return None;
        }
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log level constants passed to `ON_LOG` handlers.
pub mod log_level {
    pub const NONE: i64 = 0x00;
    pub const INFO: i64 = 0x01;
    pub const NOTICE: i64 = 0x02;
    pub const WARNING: i64 = 0x04;
    pub const ERROR: i64 = 0x08;
    pub const DEBUG: i64 = 0x10;
    pub const ALL: i64 = 0xFFFF;

    pub const NAMES: [(&str, i64); 7] = [
        ("LOG_NONE", NONE),
        ("LOG_INFO", INFO),
        ("LOG_NOTICE", NOTICE),
        ("LOG_WARNING", WARNING),
        ("LOG_ERROR", ERROR),
        ("LOG_DEBUG", DEBUG),
        ("LOG_ALL", ALL),
    ];
}

/// An event reported by the engine, with all data copied out of engine memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connect {
        rc: i32,
    },
    Disconnect {
        rc: i32,
    },
    Publish {
        mid: i32,
    },
    Message {
        mid: i32,
        topic: String,
        payload: Vec<u8>,
        qos: i32,
        retain: bool,
    },
    Subscribe {
        mid: i32,
        granted_qos: Vec<i32>,
    },
    Unsubscribe {
        mid: i32,
    },
    Log {
        level: i32,
        message: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Connect { .. } => EventKind::Connect,
            EngineEvent::Disconnect { .. } => EventKind::Disconnect,
            EngineEvent::Publish { .. } => EventKind::Publish,
            EngineEvent::Message { .. } => EventKind::Message,
            EngineEvent::Subscribe { .. } => EventKind::Subscribe,
            EngineEvent::Unsubscribe { .. } => EventKind::Unsubscribe,
            EngineEvent::Log { .. } => EventKind::Log,
        }
    }

    /// The positional arguments a handler receives for this event.
    ///
    /// Connect and disconnect codes are translated to `(success, code, description)`;
    /// every other event passes its data through in engine order.
    pub fn into_args(self) -> Vec<HostArg> {
        match self {
            EngineEvent::Connect { rc } => {
                let outcome = translate_connect(rc);
                vec![
                    HostArg::Bool(outcome.success),
                    HostArg::Int(i64::from(outcome.code)),
                    HostArg::Str(outcome.description.to_string()),
                ]
            }
            EngineEvent::Disconnect { rc } => {
                let outcome = translate_disconnect(rc);
                vec![
                    HostArg::Bool(outcome.success),
                    HostArg::Int(i64::from(outcome.code)),
                    HostArg::Str(outcome.description.to_string()),
                ]
            }
            EngineEvent::Publish { mid } | EngineEvent::Unsubscribe { mid } => {
                vec![HostArg::Int(i64::from(mid))]
            }
            EngineEvent::Message {
                mid,
                topic,
                payload,
                qos,
                retain,
            } => vec![
                HostArg::Int(i64::from(mid)),
                HostArg::Str(topic),
                HostArg::Bytes(payload),
                HostArg::Int(i64::from(qos)),
                HostArg::Bool(retain),
            ],
            EngineEvent::Subscribe { mid, granted_qos } => {
                let mut args = Vec::with_capacity(granted_qos.len() + 1);
                args.push(HostArg::Int(i64::from(mid)));
                args.extend(granted_qos.into_iter().map(|q| HostArg::Int(i64::from(q))));
                args
            }
            EngineEvent::Log { level, message } => {
                vec![HostArg::Int(i64::from(level)), HostArg::Str(message)]
            }
        }
    }
}

/// A single handler argument, independent of the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostArg {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Arbitrary bytes; hosts must not assume UTF-8.
    Bytes(Vec<u8>),
}
