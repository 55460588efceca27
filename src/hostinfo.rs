//! Host system information snapshot (§4.4 step 1: "host system info
//! (hostname, kernel, arch, CPU model/cores/MHz, total memory)").

use sysinfo::{CpuExt, System, SystemExt};

use crate::model::HostInfo;

/// Snapshots the current host's identifying system information.
#[must_use]
pub fn snapshot() -> HostInfo {
    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu = system.cpus().first();
    HostInfo {
        hostname: system.host_name().unwrap_or_else(|| "unknown".to_string()),
        kernel: system.kernel_version().unwrap_or_else(|| "unknown".to_string()),
        arch: std::env::consts::ARCH.to_string(),
        cpu_model: cpu.map(CpuExt::brand).unwrap_or("unknown").to_string(),
        cpu_cores: system.cpus().len(),
        cpu_mhz: cpu.map(CpuExt::frequency).unwrap_or(0),
        total_memory_bytes: system.total_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_a_nonzero_core_count() {
        let info = snapshot();
        assert!(info.cpu_cores > 0);
        assert!(!info.arch.is_empty());
    }
}
