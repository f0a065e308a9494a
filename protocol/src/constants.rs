//! Measurement binary defaults and outcome codes

/// Control port the binary listens on / targets when `-p` is not given.
pub const DEFAULT_CONTROL_PORT: u16 = 25000;

/// Test duration in seconds when the caller does not ask for one.
pub const DEFAULT_DURATION_SEC: u32 = 10;

pub const DEFAULT_CONNECTIONS: u32 = 1;

/// Fragment of `ErrorMessage2` printed when a downstream server ends the
/// test by simply stopping to send.
pub const TRAFFIC_STOPPED_MARKER: &str = "incoming traffic has completely stopped";

/// Outcome code reported by the binary in its `ErrorStatus` field.
///
/// Distinct from the OS exit code of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// 0, or the field is absent
    Success,

    /// 1 and 2: the test ran but the binary does not vouch for the numbers
    Inconclusive(i64),

    /// 3: a connection could not be established or was lost
    ConnectionUnavailable,

    /// 4: control protocol version mismatch
    ProtocolMismatch,

    /// 5: authentication key rejected
    AuthenticationMismatch,

    /// 200: fewer than the minimum required connections survived
    MinConnectionsUnavailable,

    Other(i64),
}

impl ErrorStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ErrorStatus::Success,
            1 | 2 => ErrorStatus::Inconclusive(code),
            3 => ErrorStatus::ConnectionUnavailable,
            4 => ErrorStatus::ProtocolMismatch,
            5 => ErrorStatus::AuthenticationMismatch,
            200 => ErrorStatus::MinConnectionsUnavailable,
            _ => ErrorStatus::Other(code),
        }
    }

    pub fn to_code(self) -> i64 {
        match self {
            ErrorStatus::Success => 0,
            ErrorStatus::Inconclusive(code) => code,
            ErrorStatus::ConnectionUnavailable => 3,
            ErrorStatus::ProtocolMismatch => 4,
            ErrorStatus::AuthenticationMismatch => 5,
            ErrorStatus::MinConnectionsUnavailable => 200,
            ErrorStatus::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorStatus::Success
    }

    /// Both "connection unavailable" flavours.
    pub fn is_connection_class(self) -> bool {
        matches!(
            self,
            ErrorStatus::ConnectionUnavailable | ErrorStatus::MinConnectionsUnavailable
        )
    }
}
