//! Reason code and engine status translation.
//!
//! Two pure mappings live here:
//! - CONNACK / disconnect codes → `(success, code, description)` delivered to handlers
//! - engine status codes → the bridge error taxonomy surfaced to scripts

use std::fmt;

use crate::error::BridgeError;

/// Connection result codes reported in the connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReasonCode {
    Accepted,
    BadProtocol,
    BadClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    TlsError,
    /// Any value outside the defined range.
    Reserved(i32),
}

impl ConnectReasonCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Accepted,
            1 => Self::BadProtocol,
            2 => Self::BadClientId,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            6 => Self::TlsError,
            other => Self::Reserved(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Accepted => 0,
            Self::BadProtocol => 1,
            Self::BadClientId => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::TlsError => 6,
            Self::Reserved(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Accepted
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Accepted => "connection accepted",
            Self::BadProtocol => "connection refused - incorrect protocol version",
            Self::BadClientId => "connection refused - invalid client identifier",
            Self::ServerUnavailable => "connection refused - server unavailable",
            Self::BadCredentials => "connection refused - bad username or password",
            Self::NotAuthorized => "connection refused - not authorised",
            Self::TlsError => "connection refused - TLS error",
            Self::Reserved(_) => "reserved for future use",
        }
    }
}

/// Translated connect/disconnect outcome as handed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub code: i32,
    pub description: &'static str,
}

/// Translate a CONNACK code.
pub fn translate_connect(code: i32) -> Outcome {
    let reason = ConnectReasonCode::from_code(code);
    Outcome {
        success: reason.is_success(),
        code,
        description: reason.description(),
    }
}

/// Translate a disconnect code: zero is a clean, client-initiated disconnect.
pub fn translate_disconnect(code: i32) -> Outcome {
    if code == 0 {
        Outcome {
            success: true,
            code,
            description: "client-initiated disconnect",
        }
    } else {
        Outcome {
            success: false,
            code,
            description: "unexpected disconnect",
        }
    }
}

/// Engine status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    NoMem,
    Protocol,
    Inval,
    NoConn,
    ConnRefused,
    NotFound,
    ConnLost,
    Tls,
    PayloadSize,
    NotSupported,
    Auth,
    AclDenied,
    Unknown,
    Errno,
    Eai,
    Proxy,
    Other(i32),
}

/// How a status is surfaced to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Returned as `nil, code, description`.
    Recoverable,
    /// Raised as a script error.
    Programming,
}

impl StatusCode {
    pub fn from_raw(rc: i32) -> Self {
        match rc {
            0 => Self::Success,
            1 => Self::NoMem,
            2 => Self::Protocol,
            3 => Self::Inval,
            4 => Self::NoConn,
            5 => Self::ConnRefused,
            6 => Self::NotFound,
            7 => Self::ConnLost,
            8 => Self::Tls,
            9 => Self::PayloadSize,
            10 => Self::NotSupported,
            11 => Self::Auth,
            12 => Self::AclDenied,
            13 => Self::Unknown,
            14 => Self::Errno,
            15 => Self::Eai,
            16 => Self::Proxy,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::NoMem => 1,
            Self::Protocol => 2,
            Self::Inval => 3,
            Self::NoConn => 4,
            Self::ConnRefused => 5,
            Self::NotFound => 6,
            Self::ConnLost => 7,
            Self::Tls => 8,
            Self::PayloadSize => 9,
            Self::NotSupported => 10,
            Self::Auth => 11,
            Self::AclDenied => 12,
            Self::Unknown => 13,
            Self::Errno => 14,
            Self::Eai => 15,
            Self::Proxy => 16,
            Self::Other(rc) => rc,
        }
    }

    pub fn class(self) -> StatusClass {
        match self {
            Self::Success => StatusClass::Success,
            Self::Inval | Self::NoMem | Self::Protocol | Self::NotSupported => {
                StatusClass::Programming
            }
            _ => StatusClass::Recoverable,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "No error.",
            Self::NoMem => "Out of memory.",
            Self::Protocol => "A network protocol error occurred when communicating with the broker.",
            Self::Inval => "Invalid function arguments provided.",
            Self::NoConn => "The client is not currently connected.",
            Self::ConnRefused => "The connection was refused.",
            Self::NotFound => "Message not found (internal error).",
            Self::ConnLost => "The connection was lost.",
            Self::Tls => "A TLS error occurred.",
            Self::PayloadSize => "Payload too large.",
            Self::NotSupported => "This feature is not supported.",
            Self::Auth => "Authorisation failed.",
            Self::AclDenied => "Access denied by ACL.",
            Self::Unknown | Self::Other(_) => "Unknown error.",
            Self::Errno => "Error defined by errno.",
            Self::Eai => "Lookup error.",
            Self::Proxy => "Proxy error.",
        }
    }
}

/// A failed engine operation.
///
/// `errno` is captured at the call site for `StatusCode::Errno`; later calls
/// may overwrite the thread's last OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineError {
    pub code: StatusCode,
    pub errno: Option<i32>,
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(code: StatusCode) -> Self {
        Self { code, errno: None }
    }

    /// An errno-class failure with an explicit OS error number.
    pub fn os(errno: i32) -> Self {
        Self {
            code: StatusCode::Errno,
            errno: Some(errno),
        }
    }

    /// Convert a raw engine return code, capturing `errno` when the code asks for it.
    pub fn check(rc: i32) -> EngineResult<()> {
        match StatusCode::from_raw(rc) {
            StatusCode::Success => Ok(()),
            StatusCode::Errno => Err(Self {
                code: StatusCode::Errno,
                errno: std::io::Error::last_os_error().raw_os_error(),
            }),
            code => Err(Self::new(code)),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.errno) {
            (StatusCode::Errno, Some(errno)) => write!(f, "{}", os_description(errno)),
            (code, _) => write!(f, "{}", code.description()),
        }
    }
}

impl std::error::Error for EngineError {}

/// OS description of an errno value, without the "(os error N)" suffix.
pub fn os_description(errno: i32) -> String {
    let text = std::io::Error::from_raw_os_error(errno).to_string();
    match text.find(" (os error") {
        Some(idx) => text[..idx].to_string(),
        None => text,
    }
}

/// Map an engine failure onto the bridge error taxonomy.
pub fn translate_status(err: EngineError) -> BridgeError {
    match (err.code, err.errno) {
        (StatusCode::Errno, Some(errno)) => BridgeError::Recoverable {
            code: errno,
            description: os_description(errno),
        },
        (code, _) => match code.class() {
            StatusClass::Programming => BridgeError::Engine {
                code: code.raw(),
                description: code.description().to_string(),
            },
            StatusClass::Recoverable | StatusClass::Success => BridgeError::Recoverable {
                code: code.raw(),
                description: code.description().to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, true, "connection accepted")]
    #[case(1, false, "connection refused - incorrect protocol version")]
    #[case(2, false, "connection refused - invalid client identifier")]
    #[case(3, false, "connection refused - server unavailable")]
    #[case(4, false, "connection refused - bad username or password")]
    #[case(5, false, "connection refused - not authorised")]
    #[case(6, false, "connection refused - TLS error")]
    #[case(99, false, "reserved for future use")]
    #[case(-1, false, "reserved for future use")]
    fn test_connect_table(#[case] code: i32, #[case] success: bool, #[case] text: &str) {
        let outcome = translate_connect(code);
        assert_eq!(outcome.success, success);
        assert_eq!(outcome.code, code);
        assert_eq!(outcome.description, text);
    }

    #[test]
    fn test_disconnect_is_binary() {
        assert_eq!(
            translate_disconnect(0),
            Outcome {
                success: true,
                code: 0,
                description: "client-initiated disconnect"
            }
        );
        // A refused-connect code means nothing special on disconnect.
        assert_eq!(translate_disconnect(5).description, "unexpected disconnect");
        assert!(!translate_disconnect(7).success);
    }

    #[rstest]
    #[case(StatusCode::Inval)]
    #[case(StatusCode::NoMem)]
    #[case(StatusCode::Protocol)]
    #[case(StatusCode::NotSupported)]
    fn test_programming_errors_are_raised(#[case] code: StatusCode) {
        let err = translate_status(EngineError::new(code));
        assert!(matches!(err, BridgeError::Engine { .. }));
    }

    #[rstest]
    #[case(StatusCode::NoConn, 4)]
    #[case(StatusCode::ConnLost, 7)]
    #[case(StatusCode::PayloadSize, 9)]
    #[case(StatusCode::ConnRefused, 5)]
    #[case(StatusCode::Other(-1), -1)]
    fn test_recoverable_errors_carry_code(#[case] code: StatusCode, #[case] raw: i32) {
        match translate_status(EngineError::new(code)) {
            BridgeError::Recoverable { code: c, description } => {
                assert_eq!(c, raw);
                assert_eq!(description, code.description());
            }
            other => panic!("expected recoverable, got {:?}", other),
        }
    }

    #[test]
    fn test_errno_reports_os_error() {
        let err = translate_status(EngineError::os(2));
        match err {
            BridgeError::Recoverable { code, description } => {
                assert_eq!(code, 2);
                assert!(!description.contains("os error"));
                assert!(!description.is_empty());
            }
            other => panic!("expected recoverable, got {:?}", other),
        }
    }

    #[test]
    fn test_check_success() {
        assert!(EngineError::check(0).is_ok());
        assert_eq!(
            EngineError::check(4),
            Err(EngineError::new(StatusCode::NoConn))
        );
    }

    proptest! {
        #[test]
        fn prop_status_code_round_trips(rc in any::<i32>()) {
            prop_assert_eq!(StatusCode::from_raw(rc).raw(), rc);
        }

        #[test]
        fn prop_connect_success_only_for_zero(rc in any::<i32>()) {
            let outcome = translate_connect(rc);
            prop_assert_eq!(outcome.success, rc == 0);
            prop_assert_eq!(outcome.code, rc);
        }
    }
}
