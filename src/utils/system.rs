// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::time::sleep;
use tokio::process::Command as TokioCommand;
use anyhow::{anyhow, Result};
use log::{error, warn};

use crate::config::defs::IOSTAT_TAG;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `args_threads` - Thread count requested on the command line
///
/// # Returns
///
/// Result<(usize, f32)> maximum cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(args_threads);
    Ok((max_cores, cpu_load))
}


/// Finds the amount of total and available RAM
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_memory_specifics(MemoryRefreshKind::everything());
    let total_ram = system.total_memory();
    let available_ram = system.available_memory();

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}


/// One-off CPU and RAM reading, taken over a one second window.
///
/// # Returns
///
/// (cpu percent, used RAM in MB)
pub async fn cpu_ram_snapshot() -> (Option<f64>, Option<f64>) {
    let refresh_kind = RefreshKind::nothing()
        .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
        .with_memory(MemoryRefreshKind::nothing().with_ram());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_secs(1).max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());

    let used = system.used_memory();
    let ram_mb = if used == 0 { None } else { Some(used as f64 / 1_048_576.0) };
    (Some(system.global_cpu_usage() as f64), ram_mb)
}


/// Peak read/write throughput (MB/s) from `iostat -d -k` device reports.
/// Header lines and rows that don't parse are skipped.
pub fn parse_iostat_peaks(output: &str) -> Option<(f64, f64)> {
    let mut peaks: Option<(f64, f64)> = None;
    for line in output.lines().skip(3) {
        if line.trim().is_empty() || line.starts_with("Device") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let (Ok(read_kb), Ok(write_kb)) = (parts[2].parse::<f64>(), parts[3].parse::<f64>()) else {
            continue;
        };
        let (read, write) = (read_kb / 1024.0, write_kb / 1024.0);
        peaks = Some(match peaks {
            Some((r, w)) => (r.max(read), w.max(write)),
            None => (read, write),
        });
    }
    peaks
}

/// Samples disk throughput once a second, `samples` times.
///
/// # Returns
///
/// (peak read MB/s, peak write MB/s); both None if iostat is missing or fails.
pub async fn disk_io_peaks(sample_id: &str, samples: u32) -> (Option<f64>, Option<f64>) {
    let output = match TokioCommand::new(IOSTAT_TAG)
        .args(["-d", "-k", "1", &samples.to_string()])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!("{} not available ({}). Install sysstat for disk I/O stats.", IOSTAT_TAG, e);
            return (None, None);
        }
    };
    if !output.status.success() {
        error!(
            "Error getting disk I/O stats for {}: {}",
            sample_id,
            String::from_utf8_lossy(&output.stderr)
        );
        return (None, None);
    }
    match parse_iostat_peaks(&String::from_utf8_lossy(&output.stdout)) {
        Some((read, write)) => (Some(read), Some(write)),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOSTAT: &str = "\
Linux 6.1.0 (gpu-node-01) \t11/01/2024 \t_x86_64_\t(64 CPU)

Device             tps    kB_read/s    kB_wrtn/s    kB_dscd/s    kB_read    kB_wrtn    kB_dscd
nvme0n1         120.00      2048.00      1024.00         0.00    9000000    4000000          0

Device             tps    kB_read/s    kB_wrtn/s    kB_dscd/s    kB_read    kB_wrtn    kB_dscd
nvme0n1         300.00     10240.00       512.00         0.00      10240        512          0
";

    #[test]
    fn test_parse_iostat_peaks() {
        assert_eq!(parse_iostat_peaks(IOSTAT), Some((10.0, 1.0)));
    }

    #[test]
    fn test_parse_iostat_no_rows() {
        assert_eq!(parse_iostat_peaks("Linux\n\nDevice tps\n"), None);
    }

    #[test]
    fn test_detect_ram() {
        let (total, available) = detect_ram().unwrap();
        assert!(total >= available);
    }
}
