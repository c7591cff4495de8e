// Synchronization primitives
//
// Binary semaphores order GPU work against GPU work (and presentation).
// Timeline semaphores carry a monotonic counter the CPU can read, advance and
// block on; frame pacing and resource recycling are built on them.

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::raw::RawDevice;

/// Single-use GPU signal with no observable value.
///
/// What it orders is decided entirely by the submissions that wait on and
/// signal it.
pub struct BinarySemaphore {
    raw_device: Arc<dyn RawDevice>,
    semaphore: vk::Semaphore,
    name: String,
}

impl BinarySemaphore {
    pub fn new(raw_device: Arc<dyn RawDevice>, name: &str) -> Result<Self> {
        let semaphore = raw_device.create_binary_semaphore()?;
        raw_device.set_object_name(vk::ObjectType::SEMAPHORE, vk::Handle::as_raw(semaphore), name);

        Ok(Self {
            raw_device,
            semaphore,
            name: name.to_string(),
        })
    }

    pub fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        self.raw_device.destroy_semaphore(self.semaphore);
    }
}

/// Monotonic `u64` counter shared between CPU and GPU.
///
/// The last value seen by this process is cached, so [`value`](Self::value)
/// never reports a smaller number than an earlier call did.
pub struct TimelineSemaphore {
    raw_device: Arc<dyn RawDevice>,
    semaphore: vk::Semaphore,
    last_seen: AtomicU64,
    /// Serializes host signals: read-then-signal must not interleave
    host_signal: Mutex<()>,
    name: String,
}

impl TimelineSemaphore {
    pub fn new(raw_device: Arc<dyn RawDevice>, initial_value: u64, name: &str) -> Result<Self> {
        let semaphore = raw_device.create_timeline_semaphore(initial_value)?;
        raw_device.set_object_name(vk::ObjectType::SEMAPHORE, vk::Handle::as_raw(semaphore), name);

        Ok(Self {
            raw_device,
            semaphore,
            last_seen: AtomicU64::new(initial_value),
            host_signal: Mutex::new(()),
            name: name.to_string(),
        })
    }

    pub fn vk_semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current counter value
    pub fn value(&self) -> Result<u64> {
        let current = self.raw_device.semaphore_counter_value(self.semaphore)?;
        let previous = self.last_seen.fetch_max(current, Ordering::AcqRel);
        Ok(previous.max(current))
    }

    /// Advance the counter from the CPU.
    ///
    /// Values at or below the current counter are ignored, the counter never
    /// moves backwards. Concurrent callers are serialized.
    pub fn set_value(&self, value: u64) -> Result<()> {
        let _guard = self.host_signal.lock();
        if self.value()? >= value {
            log::debug!(
                "Timeline '{}' already at or past {}, not signalling",
                self.name,
                value
            );
            return Ok(());
        }
        self.raw_device.signal_semaphore(self.semaphore, value)?;
        self.last_seen.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Block until the counter reaches `value` or `timeout_nanos` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Errors are reserved for API failures
    /// such as a lost device.
    pub fn wait_for_value(&self, value: u64, timeout_nanos: u64) -> Result<bool> {
        if self.last_seen.load(Ordering::Acquire) >= value {
            return Ok(true);
        }

        let reached = self.raw_device.wait_semaphore(self.semaphore, value, timeout_nanos)?;
        if reached {
            self.last_seen.fetch_max(value, Ordering::AcqRel);
        } else {
            log::debug!(
                "Timeline '{}' wait for {} timed out after {}ns",
                self.name,
                value,
                timeout_nanos
            );
        }
        Ok(reached)
    }
}

impl std::fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("name", &self.name)
            .field("semaphore", &self.semaphore)
            .field("last_seen", &self.last_seen.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        self.raw_device.destroy_semaphore(self.semaphore);
    }
}
