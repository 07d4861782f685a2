//! Task execution verification using marker files

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Helper for verifying that (and when) scripts ran, via marker files
#[derive(Clone)]
pub struct MarkerFileHelper {
    base_dir: PathBuf,
}

impl MarkerFileHelper {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.marker", name))
    }

    /// Shell snippet that creates the marker
    pub fn touch_command(&self, name: &str) -> String {
        format!("touch '{}'", self.marker_path(name).display())
    }

    /// Shell snippet that appends the current time in nanoseconds
    pub fn timestamp_command(&self, name: &str) -> String {
        format!("date +%s%N >> '{}'", self.marker_path(name).display())
    }

    pub fn marker_exists(&self, name: &str) -> bool {
        self.marker_path(name).exists()
    }

    /// Wait for a marker file to appear
    pub async fn wait_for_marker(&self, name: &str, timeout: Duration) -> bool {
        let marker_path = self.marker_path(name);
        let start = Instant::now();

        while start.elapsed() < timeout {
            if marker_path.exists() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }

        false
    }

    /// Wait for a marker file to have content and return it
    pub async fn wait_for_marker_content(&self, name: &str, timeout: Duration) -> Option<String> {
        let marker_path = self.marker_path(name);
        let start = Instant::now();

        while start.elapsed() < timeout {
            if let Ok(content) = std::fs::read_to_string(&marker_path)
                && !content.is_empty()
            {
                return Some(content);
            }
            sleep(Duration::from_millis(50)).await;
        }

        None
    }

    pub fn read_marker(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.marker_path(name)).ok()
    }

    /// Timestamps written by [`timestamp_command`](Self::timestamp_command), in order
    pub fn read_timestamps(&self, name: &str) -> Vec<u128> {
        self.read_marker(name)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    pub fn count_marker_lines(&self, name: &str) -> usize {
        self.read_marker(name)
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }
}
