//! 宿主机信息采集

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::domain::service::Platform;
use crate::domain::system::HostInfo;

/// 采集当前宿主机的静态信息
pub fn collect_host_info() -> HostInfo {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_cpu_all();

    let cpu_brand = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    HostInfo {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        platform: Platform::current(),
        os_version: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        cpu_arch: std::env::consts::ARCH.to_string(),
        cpu_count: sys.cpus().len(),
        cpu_brand,
        total_memory_gb: sys.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_host_info() {
        let host = collect_host_info();
        assert_eq!(host.platform, Platform::current());
        assert_eq!(host.cpu_arch, std::env::consts::ARCH);
        assert!(!host.hostname.is_empty());
    }
}
