/*!
 * Cipher suite negotiation.
 *
 * Robot firmware generations disagree on which TLS cipher they accept. The
 * negotiator walks an ordered list of suites, moving to the next one whenever a
 * connection attempt fails in a way that looks like a cipher or identity
 * rejection.
 */
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Suites tried against the robot, in order
pub const ROBOT_CIPHERS: [&str; 2] = ["AES128-SHA256", "TLS_AES_256_GCM_SHA384"];

/// A named TLS cipher suite
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherSuite(String);

impl CipherSuite {
    /// Create a suite from its OpenSSL-style name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// The suite name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The default suite list
pub fn default_suites() -> Vec<CipherSuite> {
    ROBOT_CIPHERS.iter().map(|name| CipherSuite::new(*name)).collect()
}

/// What to do after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Try again with the next cipher suite
    RetryWithNext,
    /// Give up
    Fatal,
}

/// Decides whether a transport error is worth another cipher
pub trait FailureClassifier: Send + Sync + Debug {
    /// Classify a transport error message
    fn classify(&self, message: &str) -> FailureClass;
}

/// Treats TLS failures and identifier rejections as retryable
///
/// The transport only reports free-form messages, so this matches on text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsRejectionClassifier;

impl FailureClassifier for TlsRejectionClassifier {
    fn classify(&self, message: &str) -> FailureClass {
        let message = message.to_ascii_lowercase();
        if message.contains("tls") || message.contains("identifier rejected") {
            FailureClass::RetryWithNext
        } else {
            FailureClass::Fatal
        }
    }
}

/// Chooses the cipher suite for the next connection attempt
#[derive(Debug)]
pub struct CipherNegotiator {
    suites: Vec<CipherSuite>,
    current: AtomicUsize,
    classifier: Box<dyn FailureClassifier>,
}

impl CipherNegotiator {
    /// Create a negotiator over the given suites, starting at the first one
    pub fn new(suites: Vec<CipherSuite>) -> Result<Self> {
        if suites.is_empty() {
            return Err(DeviceError::ConfigurationError(
                "At least one cipher suite is required".to_string(),
            ));
        }
        Ok(Self {
            suites,
            current: AtomicUsize::new(0),
            classifier: Box::new(TlsRejectionClassifier),
        })
    }

    /// Replace the failure classifier
    pub fn with_classifier<C: FailureClassifier + 'static>(mut self, classifier: C) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// The suite the next attempt will use
    pub fn current(&self) -> &CipherSuite {
        &self.suites[self.current_index()]
    }

    /// Index of the current suite
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Number of suites, which is also the attempt cap per connection
    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    /// Move to the next suite, wrapping around, and return it
    pub fn advance(&self) -> &CipherSuite {
        let count = self.suites.len();
        let previous = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |index| {
                Some((index + 1) % count)
            })
            .unwrap_or_else(|index| index);
        let next = &self.suites[(previous + 1) % count];
        debug!("Cipher advanced from {} to {}", self.suites[previous], next);
        next
    }

    /// Classify a transport error
    pub fn classify(&self, message: &str) -> FailureClass {
        self.classifier.classify(message)
    }
}

impl Default for CipherNegotiator {
    fn default() -> Self {
        Self {
            suites: default_suites(),
            current: AtomicUsize::new(0),
            classifier: Box::new(TlsRejectionClassifier),
        }
    }
}
