//! Test fixtures for storage testing.

/// Creates a temporary directory and a path for an output file inside it.
///
/// The directory is removed when the returned guard is dropped.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created. This is acceptable
/// in test fixtures where failures indicate environment issues.
pub fn create_temp_output(file_name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join(file_name);
    (temp_dir, path)
}
