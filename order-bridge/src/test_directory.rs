use std::path::PathBuf;

use rand::Rng;

/// Scratch data directory for a single test, removed again by `Drop` even if the test fails.
pub struct TestDirectory {
    /// The path of the created directory.
    pub path: PathBuf,
}

impl TestDirectory {
    /// Creates a randomly named directory under `test_data/`.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let sub_directory_name: u128 = rng.gen();
        let path = PathBuf::from(format!("test_data/{sub_directory_name}"));

        std::fs::create_dir_all(&path).unwrap();

        TestDirectory { path }
    }
}

impl Drop for TestDirectory {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
