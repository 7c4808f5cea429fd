use super::error::{MonitoringError, Result};
use super::{ComponentSignals, ConnectionStrength};
use parking_lot::Mutex;
use std::fmt;
use sysinfo::{get_current_pid, Pid, System};
use tracing::debug;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Signals gathered by a probe during one evaluation tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReading {
    pub memory_usage_mib: Option<f64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub connections: Vec<ConnectionStrength>,
}

impl ProbeReading {
    pub fn memory(mib: f64) -> Self {
        Self {
            memory_usage_mib: Some(mib),
            ..Default::default()
        }
    }

    /// Fold this reading into a component's accumulated signals.
    pub fn apply(&self, signals: &mut ComponentSignals, connection_history: usize) {
        if let Some(mib) = self.memory_usage_mib {
            signals.memory_usage_mib = Some(mib);
        }
        signals.cache_hits += self.cache_hits;
        signals.cache_misses += self.cache_misses;
        for strength in &self.connections {
            signals.push_connection(*strength, connection_history);
        }
    }
}

/// Source of component signals polled on every evaluation tick.
pub trait ComponentProbe: Send + Sync + fmt::Debug {
    /// Component key the reading is attributed to
    fn component(&self) -> &str;

    fn sample(&self) -> Result<ProbeReading>;
}

/// Resident memory of the current process.
pub struct ProcessMemoryProbe {
    component: String,
    pid: Pid,
    system: Mutex<System>,
}

impl fmt::Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemoryProbe")
            .field("component", &self.component)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessMemoryProbe {
    pub fn new(component: impl Into<String>) -> Result<Self> {
        let component = component.into();
        let pid = get_current_pid().map_err(|e| MonitoringError::ProbeFailed {
            probe: component.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            component,
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl ComponentProbe for ProcessMemoryProbe {
    fn component(&self) -> &str {
        &self.component
    }

    fn sample(&self) -> Result<ProbeReading> {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);

        let bytes = system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| MonitoringError::ProbeFailed {
                probe: self.component.clone(),
                message: format!("process {} not found", self.pid),
            })?;

        let mib = bytes as f64 / BYTES_PER_MIB;
        debug!(component = %self.component, memory_mib = mib, "Sampled process memory");
        Ok(ProbeReading::memory(mib))
    }
}

/// Probe backed by a closure, for hosts that already track their own counters.
pub struct FnProbe<F> {
    component: String,
    sample: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> Result<ProbeReading> + Send + Sync,
{
    pub fn new(component: impl Into<String>, sample: F) -> Self {
        Self {
            component: component.into(),
            sample,
        }
    }
}

impl<F> fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe")
            .field("component", &self.component)
            .finish()
    }
}

impl<F> ComponentProbe for FnProbe<F>
where
    F: Fn() -> Result<ProbeReading> + Send + Sync,
{
    fn component(&self) -> &str {
        &self.component
    }

    fn sample(&self) -> Result<ProbeReading> {
        (self.sample)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_memory_probe_reports_usage() {
        let probe = ProcessMemoryProbe::new("process").unwrap();
        let reading = probe.sample().unwrap();
        assert!(reading.memory_usage_mib.unwrap() > 0.0);
        assert_eq!(probe.component(), "process");
    }

    #[test]
    fn test_reading_applies_to_signals() {
        let mut signals = ComponentSignals::default();
        let reading = ProbeReading {
            memory_usage_mib: Some(64.0),
            cache_hits: 3,
            cache_misses: 1,
            connections: vec![ConnectionStrength::Weak, ConnectionStrength::Strong],
        };

        reading.apply(&mut signals, 100);
        reading.apply(&mut signals, 100);

        assert_eq!(signals.memory_usage_mib, Some(64.0));
        assert_eq!(signals.cache_hits, 6);
        assert_eq!(signals.connections.len(), 4);
        assert_eq!(signals.weak_connection_ratio(), Some(0.5));
    }

    #[test]
    fn test_fn_probe_propagates_errors() {
        let probe = FnProbe::new("flaky", || {
            Err(MonitoringError::ProbeFailed {
                probe: "flaky".to_string(),
                message: "unreachable".to_string(),
            })
        });
        assert!(probe.sample().is_err());
    }
}
