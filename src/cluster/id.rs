//! Cluster identifiers.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_LENGTH: usize = 32;

/// Random token naming one allocation attempt.
///
/// Identifiers are 32 lowercase ASCII letters. They partition backend
/// resources per cluster; collisions are improbable but not prevented.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Generates a fresh identifier from the thread-local generator.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..ID_LENGTH)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        Self(token)
    }

    /// Borrows the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the identifier has the shape produced by
    /// [`ClusterId::generate`].
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == ID_LENGTH && self.0.bytes().all(|byte| byte.is_ascii_lowercase())
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
