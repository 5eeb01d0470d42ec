//! Protected targets

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Identifier of a protected application.
///
/// Either a bare program name (resolved through `PATH` and matched against
/// process names) or an absolute path to an executable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id names a path rather than a bare program name
    pub fn is_path(&self) -> bool {
        self.0.contains(std::path::MAIN_SEPARATOR) || self.0.contains('/')
    }

    /// Anchor a relative path target at the current directory.
    ///
    /// Watchdogs run from other directories, so only absolute paths mean the
    /// same program to all of them. Bare names are left alone.
    pub fn into_absolute(self) -> std::io::Result<Self> {
        if !self.is_path() || Path::new(&self.0).is_absolute() {
            return Ok(self);
        }
        let path = std::path::absolute(&self.0)?;
        Ok(Self(path.to_string_lossy().into_owned()))
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The set of applications under protection
pub type ProtectionSet = BTreeSet<TargetId>;
