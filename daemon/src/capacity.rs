//! Pure bookkeeping over the sandbox table: admits or rejects create
//! requests without touching the filesystem or the hypervisor.

use crate::config::ResourceLimits;
use crate::types::HealthReport;

/// Why admission was refused. `Validation` covers range errors the caller
/// could have avoided by sending a different request (→ 400); `Capacity`
/// covers host-wide headroom the caller has no control over (→ 503).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    Validation(String),
    Capacity(String),
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::Validation(reason) | AdmitError::Capacity(reason) => write!(f, "{reason}"),
        }
    }
}

pub struct CapacityAccountant<'a> {
    limits: &'a ResourceLimits,
    memory_budget_mb: u32,
}

impl<'a> CapacityAccountant<'a> {
    pub fn new(limits: &'a ResourceLimits, memory_budget_mb: u32) -> Self {
        Self {
            limits,
            memory_budget_mb,
        }
    }

    /// Checks, in order: live-count headroom, requested-memory range,
    /// requested memory against what's actually available. First failure
    /// wins; its reason string is stable and its variant tells the caller
    /// whether to answer 400 (validation) or 503 (capacity).
    pub fn can_admit(
        &self,
        live_count: usize,
        memory_used_mb: u32,
        req_mem_mb: u32,
    ) -> Result<(), AdmitError> {
        if live_count >= self.limits.max_sandboxes {
            return Err(AdmitError::Capacity("Maximum sandbox limit reached".to_string()));
        }
        if req_mem_mb < self.limits.min_memory_mb {
            return Err(AdmitError::Validation(format!(
                "Memory too low: {req_mem_mb} MiB < minimum {} MiB",
                self.limits.min_memory_mb
            )));
        }
        if req_mem_mb > self.limits.max_memory_mb {
            return Err(AdmitError::Validation(format!(
                "Memory too high: {req_mem_mb} MiB > maximum {} MiB",
                self.limits.max_memory_mb
            )));
        }
        let available = self.memory_budget_mb.saturating_sub(memory_used_mb);
        if req_mem_mb > available {
            return Err(AdmitError::Capacity(format!(
                "Insufficient memory: requested {req_mem_mb} MiB, {available} MiB available"
            )));
        }
        Ok(())
    }

    pub fn report(
        &self,
        active_sandboxes: usize,
        memory_used_mb: u32,
    ) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            active_sandboxes,
            max_sandboxes: self.limits.max_sandboxes,
            memory_used_mb,
            memory_available_mb: self.memory_budget_mb.saturating_sub(memory_used_mb),
            memory_budget_mb: self.memory_budget_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            default_memory_mb: 512,
            min_memory_mb: 256,
            max_memory_mb: 2048,
            default_vcpu_count: 1,
            min_vcpu_count: 1,
            max_vcpu_count: 4,
            max_sandboxes: 2,
            host_reserved_memory_mb: 0,
        }
    }

    #[test]
    fn rejects_at_max_sandboxes() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 8192);
        let err = accountant.can_admit(2, 0, 512).unwrap_err();
        assert!(matches!(err, AdmitError::Capacity(ref r) if r.contains("Maximum sandbox limit")));
    }

    #[test]
    fn rejects_memory_below_minimum_as_validation_error() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 8192);
        let err = accountant.can_admit(0, 0, 128).unwrap_err();
        assert!(matches!(err, AdmitError::Validation(ref r) if r.contains("Memory too low")));
    }

    #[test]
    fn rejects_memory_above_maximum_as_validation_error() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 8192);
        let err = accountant.can_admit(0, 0, 4096).unwrap_err();
        assert!(matches!(err, AdmitError::Validation(ref r) if r.contains("Memory too high")));
    }

    #[test]
    fn rejects_insufficient_available_memory_as_capacity_error() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 1024);
        let err = accountant.can_admit(0, 900, 512).unwrap_err();
        assert!(matches!(err, AdmitError::Capacity(ref r) if r.contains("Insufficient memory")));
    }

    #[test]
    fn admits_within_all_bounds() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 8192);
        assert!(accountant.can_admit(0, 0, 512).is_ok());
    }

    #[test]
    fn paused_memory_does_not_count_against_budget() {
        let limits = limits();
        let accountant = CapacityAccountant::new(&limits, 1024);
        // Only running memory is passed in as `memory_used_mb`; a caller
        // that excludes paused sandboxes from that sum sees full headroom.
        assert!(accountant.can_admit(1, 0, 1024).is_ok());
    }
}
