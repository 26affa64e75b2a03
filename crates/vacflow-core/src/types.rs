/*!
 * Core data types for vacflow.
 *
 * This module defines the identity of a robot as handed to us by the
 * discovery/credential tooling.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// The robot's pairing password
///
/// The value never shows up in `Debug` or `Display` output, so identities can be
/// logged freely.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Wrap a password
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Expose the raw password to the transport
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the password is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Everything needed to open a connection to one robot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// The robot's local identifier (the "blid")
    pub local_id: String,
    /// The pairing password
    pub shared_secret: SharedSecret,
    /// Hostname or IP address on the local network
    pub address: String,
}

impl DeviceIdentity {
    /// Create a new identity
    pub fn new<A, B, C>(local_id: A, shared_secret: B, address: C) -> Self
    where
        A: Into<String>,
        B: Into<String>,
        C: Into<String>,
    {
        Self {
            local_id: local_id.into(),
            shared_secret: SharedSecret::new(shared_secret),
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_id, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let identity = DeviceIdentity::new("3145C70123456789", "hunter2", "192.168.1.40");
        let debug = format!("{:?}", identity);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("3145C70123456789"));
        assert_eq!(identity.shared_secret.expose(), "hunter2");
        assert_eq!(identity.to_string(), "3145C70123456789@192.168.1.40");
    }
}
