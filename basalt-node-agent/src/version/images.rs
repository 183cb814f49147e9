//! Local container-image existence checks with per-pass memoization.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Answers "is this image present on the local host". Failures to reach
/// the local container runtime count as "absent" (and are logged), so a
/// flaky runtime can never report a version as available.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn image_exists(&self, image: &str) -> bool;
}

/// Production inspector shelling out to the docker CLI.
pub struct DockerCliInspector;

#[async_trait]
impl ImageInspector for DockerCliInspector {
    async fn image_exists(&self, image: &str) -> bool {
        let result = Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(
                    "found image {image}, id: {}",
                    String::from_utf8_lossy(&output.stdout).trim()
                );
                true
            }
            Ok(output) => {
                debug!(
                    "image {image} not present locally: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(err) => {
                warn!("failed to query local image store for {image}: {err}");
                false
            }
        }
    }
}

/// Memoizes existence answers for the duration of one reconciliation pass.
///
/// Cleared at the start and end of every pass; never carried across passes,
/// so a pull or prune between passes is always observed.
#[derive(Default)]
pub struct ImageExistenceCache {
    entries: HashMap<String, bool>,
}

impl ImageExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub async fn exists(&mut self, inspector: &dyn ImageInspector, image: &str) -> bool {
        if let Some(&cached) = self.entries.get(image) {
            return cached;
        }
        let present = inspector.image_exists(image).await;
        self.entries.insert(image.to_string(), present);
        present
    }
}
