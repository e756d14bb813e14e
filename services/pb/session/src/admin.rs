//! Administrative shutdown over an established session.
//!
//! An admin client opens an ordinary session with a server and emits one of
//! the shutdown events below, with the server's shared secret as payload.
//! The three severities differ only in how the server tears down.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use std::fmt;
use std::str::FromStr;

/// Stop accepting and wait for open sessions to end
pub const SHUTDOWN_SERVER: &str = "SHUTDOWN_SERVER";
/// Stop accepting and close every session now
pub const FORCE_SHUTDOWN_SERVER: &str = "FORCE_SHUTDOWN_SERVER";
/// Close everything and terminate without waiting
pub const VADER_SHUTDOWN_SERVER: &str = "VADER_SHUTDOWN_SERVER";

/// Shutdown severity, ordered from mildest to harshest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownKind {
    /// Wait for open sessions
    Graceful,
    /// Close open sessions, wait for them to close
    Forced,
    /// Close open sessions, do not wait
    Immediate,
}

impl ShutdownKind {
    /// Every severity
    pub const ALL: [ShutdownKind; 3] = [ShutdownKind::Graceful, ShutdownKind::Forced, ShutdownKind::Immediate];

    /// Event carrying a request for this severity
    pub fn event_name(self) -> &'static str {
        match self {
            ShutdownKind::Graceful => SHUTDOWN_SERVER,
            ShutdownKind::Forced => FORCE_SHUTDOWN_SERVER,
            ShutdownKind::Immediate => VADER_SHUTDOWN_SERVER,
        }
    }

    /// Severity requested by an event name
    pub fn from_event(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownKind::Graceful => write!(f, "graceful"),
            ShutdownKind::Forced => write!(f, "forced"),
            ShutdownKind::Immediate => write!(f, "immediate"),
        }
    }
}

impl FromStr for ShutdownKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graceful" => Ok(ShutdownKind::Graceful),
            "forced" | "force" => Ok(ShutdownKind::Forced),
            "immediate" | "vader" => Ok(ShutdownKind::Immediate),
            other => Err(format!("unknown shutdown kind: {}", other)),
        }
    }
}

/// Check a presented secret against the configured one.
///
/// A server without a configured secret accepts no requests.
pub fn authorize(expected: Option<&str>, presented: &[u8]) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let expected = expected.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Ask the server behind `endpoint` to shut down
pub fn request_shutdown(endpoint: &Endpoint, kind: ShutdownKind, secret: &str) -> Result<(), EndpointError> {
    endpoint.emit(kind.event_name(), secret.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize() {
        assert!(authorize(Some("hunter2"), b"hunter2"));
        assert!(!authorize(Some("hunter2"), b"hunter3"));
        assert!(!authorize(Some("hunter2"), b"hunter"));
        assert!(!authorize(None, b""));
        assert!(!authorize(None, b"anything"));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ShutdownKind::from_event("FORCE_SHUTDOWN_SERVER"), Some(ShutdownKind::Forced));
        assert_eq!(ShutdownKind::from_event("REBOOT_SERVER"), None);
        for kind in ShutdownKind::ALL {
            assert_eq!(ShutdownKind::from_event(kind.event_name()), Some(kind));
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("vader".parse::<ShutdownKind>(), Ok(ShutdownKind::Immediate));
        assert_eq!("Graceful".parse::<ShutdownKind>(), Ok(ShutdownKind::Graceful));
        assert!("gentle".parse::<ShutdownKind>().is_err());
        assert!(ShutdownKind::Graceful < ShutdownKind::Immediate);
    }
}
