// SPDX-License-Identifier: Apache-2.0

// Try not to implement From for NetbridgeError here unless the source
// error always maps to one specific ErrorKind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad key/value or composite-rule violation in a network config map.
    Validation,
    /// Duplicate interface/forward, or an overlapping range/subnet.
    Conflict,
    /// Operation not possible in the current state (e.g. starting a
    /// `Pending` network, missing `dnsmasq` binary).
    Precondition,
    /// netlink/sysctl/firewall/subprocess failure expected to be retryable.
    TransientIo,
    /// Cluster DB or peer RPC failure.
    External,
    /// A supervised child process exited prematurely.
    Supervision,
    /// Internal invariant violated; reached only through a driver bug.
    Bug,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetbridgeError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl NetbridgeError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn validation(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::Validation,
            format!("invalid value for '{key}': {reason}"),
        )
    }

    pub fn conflict(resource: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Conflict, format!("conflicts with {resource}"))
    }

    /// Wraps `self` with additional context, keeping the original kind.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        Self::new(self.kind, format!("{context}: {}", self.msg))
    }
}

impl std::fmt::Display for NetbridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for NetbridgeError {}

pub type Result<T> = std::result::Result<T, NetbridgeError>;
