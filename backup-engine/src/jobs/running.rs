//! Set of volumes with a job in flight.

use crate::utils::errors::{EngineError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct RunningVolumes {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl RunningVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, volume: &str) -> bool {
        self.lock().contains(volume)
    }

    /// Claim every volume or none. Fails with `Conflict` naming the busy ones.
    pub fn claim(&self, volumes: &[String]) -> Result<VolumeClaim> {
        let mut running = self.lock();
        let busy: Vec<&str> = volumes
            .iter()
            .filter(|v| running.contains(v.as_str()))
            .map(String::as_str)
            .collect();
        if !busy.is_empty() {
            return Err(EngineError::Conflict(format!(
                "a job is already running for volume(s): {}",
                busy.join(", ")
            )));
        }
        for volume in volumes {
            running.insert(volume.clone());
        }
        Ok(VolumeClaim {
            set: self.clone(),
            volumes: volumes.to_vec(),
        })
    }
}

/// Releases its volumes when dropped.
pub struct VolumeClaim {
    set: RunningVolumes,
    volumes: Vec<String>,
}

impl Drop for VolumeClaim {
    fn drop(&mut self) {
        let mut running = self.set.lock();
        for volume in &self.volumes {
            running.remove(volume);
        }
    }
}
