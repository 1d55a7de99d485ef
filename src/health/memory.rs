use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports the fraction of system memory in use
pub trait MemorySource: Send + Sync {
    /// `None` when the platform gives no answer
    fn usage(&self) -> Option<f64>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new("/proc/meminfo")
    }
}

impl MemorySource for ProcMeminfo {
    fn usage(&self) -> Option<f64> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => parse_meminfo(&contents),
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "Memory usage unavailable");
                None
            }
        }
    }
}

pub fn parse_meminfo(contents: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<f64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<f64>().ok()),
            _ => {}
        }
    }

    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

/// Source returning whatever it was last set to
pub struct FixedMemory {
    bits: AtomicU64,
}

impl FixedMemory {
    pub fn new(usage: f64) -> Self {
        Self {
            bits: AtomicU64::new(usage.to_bits()),
        }
    }

    pub fn set(&self, usage: f64) {
        self.bits.store(usage.to_bits(), Ordering::Relaxed);
    }
}

impl MemorySource for FixedMemory {
    fn usage(&self) -> Option<f64> {
        Some(f64::from_bits(self.bits.load(Ordering::Relaxed)))
    }
}
