//! Temporary directory management for tests.
//!
//! [`TestDir`] wraps [`tempfile::TempDir`] with a cleaner API for common test patterns.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A managed temporary directory for tests.
///
/// The directory is automatically cleaned up when this struct is dropped.
///
/// # Example
///
/// ```
/// use etcdwarden_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let data_dir = dir.join("default.etcd");
/// // Use data_dir as a restore target...
/// // Directory cleaned up when `dir` goes out of scope
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Create a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Join a relative path to the temporary directory.
    ///
    /// This is a convenience method equivalent to `dir.path().join(path)`.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Write `contents` to a file under the directory and return its path.
    ///
    /// Useful for staging pre-fetched snapshot blobs.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn file<P: AsRef<Path>>(&self, path: P, contents: &[u8]) -> PathBuf {
        let full = self.join(path);
        std::fs::write(&full, contents).expect("failed to write test file");
        full
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
