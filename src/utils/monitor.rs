//! Background sampling of a hardware utilisation signal.
//!
//! A monitor keeps only running maxima. Any probe failure invalidates the
//! whole window: partial peaks are never reported.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, Result};
use log::{debug, error};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use crate::cli::MonitorDevice;
use crate::config::defs::{MonitorWindow, NVIDIA_SMI_TAG};


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    /// Percent busy.
    pub utilization: f64,
    /// Memory in use, MB.
    pub secondary: f64,
}

pub trait HardwareProbe: Send + Sync + 'static {
    fn sample(&self) -> impl Future<Output = Result<ProbeReading>> + Send;

    fn device(&self) -> &'static str;
}


/// Parses `nvidia-smi --query-gpu=utilization.gpu,memory.used --format=csv,noheader,nounits`.
/// With several GPUs the busiest value of each column is reported.
pub fn parse_nvidia_smi(text: &str) -> Result<ProbeReading> {
    let mut reading: Option<ProbeReading> = None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (util, mem) = line
            .split_once(',')
            .ok_or_else(|| anyhow!("Unexpected nvidia-smi line: {}", line))?;
        let util: f64 = util.trim().parse()?;
        let mem: f64 = mem.trim().parse()?;
        reading = Some(match reading {
            Some(r) => ProbeReading { utilization: r.utilization.max(util), secondary: r.secondary.max(mem) },
            None => ProbeReading { utilization: util, secondary: mem },
        });
    }
    reading.ok_or_else(|| anyhow!("No GPUs reported by {}", NVIDIA_SMI_TAG))
}

#[derive(Debug, Clone, Default)]
pub struct NvidiaSmiProbe;

impl HardwareProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Result<ProbeReading> {
        let output = Command::new(NVIDIA_SMI_TAG)
            .args(["--query-gpu=utilization.gpu,memory.used", "--format=csv,noheader,nounits"])
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}", NVIDIA_SMI_TAG, e))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                NVIDIA_SMI_TAG,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }

    fn device(&self) -> &'static str {
        "gpu"
    }
}


/// Global CPU percent and used RAM via sysinfo. CPU usage is relative to the
/// previous sample, so the first reading of a window may be low.
pub struct CpuProbe {
    system: Mutex<System>,
}

impl CpuProbe {
    pub fn new() -> Self {
        let refresh_kind = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        CpuProbe { system: Mutex::new(System::new_with_specifics(refresh_kind)) }
    }

    fn read(&self) -> Result<ProbeReading> {
        let mut system = self.system.lock().map_err(|_| anyhow!("CPU probe lock poisoned"))?;
        system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        Ok(ProbeReading {
            utilization: system.global_cpu_usage() as f64,
            secondary: system.used_memory() as f64 / 1_048_576.0,
        })
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for CpuProbe {
    fn sample(&self) -> impl Future<Output = Result<ProbeReading>> + Send {
        std::future::ready(self.read())
    }

    fn device(&self) -> &'static str {
        "cpu"
    }
}


/// The probe selected on the command line.
pub enum SystemProbe {
    Gpu(NvidiaSmiProbe),
    Cpu(CpuProbe),
}

impl SystemProbe {
    pub fn for_device(device: MonitorDevice) -> Self {
        match device {
            MonitorDevice::Gpu => SystemProbe::Gpu(NvidiaSmiProbe),
            MonitorDevice::Cpu => SystemProbe::Cpu(CpuProbe::new()),
        }
    }
}

impl HardwareProbe for SystemProbe {
    async fn sample(&self) -> Result<ProbeReading> {
        match self {
            SystemProbe::Gpu(p) => p.sample().await,
            SystemProbe::Cpu(p) => p.sample().await,
        }
    }

    fn device(&self) -> &'static str {
        match self {
            SystemProbe::Gpu(p) => p.device(),
            SystemProbe::Cpu(p) => p.device(),
        }
    }
}


#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakUtilization {
    pub utilization: Option<f64>,
    pub secondary: Option<f64>,
}

impl PeakUtilization {
    pub fn unavailable() -> Self {
        Self::default()
    }
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceMonitor {
    pub window: MonitorWindow,
    pub interval: Duration,
}

impl ResourceMonitor {
    pub fn new(window: MonitorWindow, interval: Duration) -> Self {
        ResourceMonitor { window, interval }
    }

    /// Samples `probe` once per interval until the window closes.
    ///
    /// In `Fixed` mode `stop` is ignored and the full window is always
    /// sampled, even if the instrumented stage finished long before.
    pub async fn run<P: HardwareProbe>(&self, probe: &P, mut stop: oneshot::Receiver<()>) -> PeakUtilization {
        let (limit, honors_stop) = match self.window {
            MonitorWindow::Fixed(d) => (Some(d), false),
            MonitorWindow::UntilStopped { max } => (max, true),
        };

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(ticker);

        let start = Instant::now();
        let mut peak_util = 0.0_f64;
        let mut peak_secondary = 0.0_f64;
        let mut samples = 0usize;

        loop {
            tokio::select! {
                // A due tick is always taken before a pending stop.
                biased;
                _ = ticks.next() => {}
                _ = &mut stop, if honors_stop => {
                    debug!("{} monitor stopped after {} samples", probe.device(), samples);
                    break;
                }
            }
            if limit.is_some_and(|d| start.elapsed() >= d) {
                break;
            }
            match probe.sample().await {
                Ok(reading) => {
                    peak_util = peak_util.max(reading.utilization);
                    peak_secondary = peak_secondary.max(reading.secondary);
                    samples += 1;
                }
                Err(e) => {
                    error!("Error monitoring {} usage: {}", probe.device(), e);
                    return PeakUtilization::unavailable();
                }
            }
        }

        if samples == 0 {
            debug!("{} monitor closed before its first sample", probe.device());
            return PeakUtilization::unavailable();
        }
        PeakUtilization { utilization: Some(peak_util), secondary: Some(peak_secondary) }
    }

    /// Starts `run` on its own task.
    pub fn spawn<P: HardwareProbe>(&self, probe: Arc<P>) -> MonitorHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = *self;
        let task = tokio::spawn(async move { monitor.run(probe.as_ref(), stop_rx).await });
        MonitorHandle { task, stop: Some(stop_tx) }
    }
}


pub struct MonitorHandle {
    task: JoinHandle<PeakUtilization>,
    stop: Option<oneshot::Sender<()>>,
}

impl MonitorHandle {
    /// Signals the foreground is done and waits for the peaks. A `Fixed`
    /// monitor still runs out its window first.
    pub async fn finish(mut self) -> PeakUtilization {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(peaks) => peaks,
            Err(e) => {
                error!("Monitor task failed: {}", e);
                PeakUtilization::unavailable()
            }
        }
    }

    /// Drops the monitor without waiting; used once the peaks are no longer wanted.
    pub fn abandon(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays fixed readings; `None` entries fail.
    struct ScriptedProbe {
        readings: Vec<Option<(f64, f64)>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<Option<(f64, f64)>>) -> Arc<Self> {
            Arc::new(ScriptedProbe { readings, calls: AtomicUsize::new(0) })
        }
    }

    impl HardwareProbe for ScriptedProbe {
        fn sample(&self) -> impl Future<Output = Result<ProbeReading>> + Send {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let reading = self.readings.get(i).copied().unwrap_or(Some((1.0, 1.0)));
            std::future::ready(
                reading
                    .map(|(u, s)| ProbeReading { utilization: u, secondary: s })
                    .ok_or_else(|| anyhow!("probe failed on tick {}", i + 1)),
            )
        }

        fn device(&self) -> &'static str {
            "gpu"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_reports_peaks() {
        let probe = ScriptedProbe::new(vec![Some((10.0, 900.0)), Some((55.0, 400.0)), Some((30.0, 1200.0))]);
        let monitor = ResourceMonitor::new(MonitorWindow::Fixed(Duration::from_secs(3)), Duration::from_secs(1));
        let (_tx, rx) = oneshot::channel();
        let peaks = monitor.run(probe.as_ref(), rx).await;
        assert_eq!(peaks, PeakUtilization { utilization: Some(55.0), secondary: Some(1200.0) });
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_second_tick_discards_everything() {
        let probe = ScriptedProbe::new(vec![Some((80.0, 2048.0)), None, Some((90.0, 4096.0))]);
        let monitor = ResourceMonitor::new(MonitorWindow::Fixed(Duration::from_secs(10)), Duration::from_secs(1));
        let (_tx, rx) = oneshot::channel();
        let peaks = monitor.run(probe.as_ref(), rx).await;
        assert_eq!(peaks, PeakUtilization::unavailable());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_ignores_stop() {
        let probe = ScriptedProbe::new(vec![]);
        let monitor = ResourceMonitor::new(MonitorWindow::Fixed(Duration::from_secs(5)), Duration::from_secs(1));
        let start = Instant::now();
        let handle = monitor.spawn(probe.clone());
        let peaks = handle.finish().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(peaks.utilization, Some(1.0));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_stopped_ends_on_signal() {
        let probe = ScriptedProbe::new(vec![Some((20.0, 100.0)), Some((70.0, 300.0))]);
        let monitor = ResourceMonitor::new(
            MonitorWindow::UntilStopped { max: Some(Duration::from_secs(600)) },
            Duration::from_secs(1),
        );
        let start = Instant::now();
        let handle = monitor.spawn(probe.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let peaks = handle.finish().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(peaks, PeakUtilization { utilization: Some(70.0), secondary: Some(300.0) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_stopped_respects_max() {
        let probe = ScriptedProbe::new(vec![]);
        let monitor = ResourceMonitor::new(
            MonitorWindow::UntilStopped { max: Some(Duration::from_secs(4)) },
            Duration::from_secs(1),
        );
        let (_tx, rx) = oneshot::channel();
        let peaks = monitor.run(probe.as_ref(), rx).await;
        assert_eq!(peaks.utilization, Some(1.0));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_is_unavailable() {
        let probe = ScriptedProbe::new(vec![Some((99.0, 99.0))]);
        let monitor = ResourceMonitor::new(MonitorWindow::Fixed(Duration::ZERO), Duration::from_secs(1));
        let (_tx, rx) = oneshot::channel();
        let peaks = monitor.run(probe.as_ref(), rx).await;
        assert_eq!(peaks, PeakUtilization::unavailable());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_still_takes_first_sample() {
        let probe = ScriptedProbe::new(vec![Some((42.0, 512.0))]);
        let monitor = ResourceMonitor::new(
            MonitorWindow::UntilStopped { max: Some(Duration::from_secs(60)) },
            Duration::from_secs(1),
        );
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        let peaks = monitor.run(probe.as_ref(), rx).await;
        assert_eq!(peaks, PeakUtilization { utilization: Some(42.0), secondary: Some(512.0) });
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let reading = parse_nvidia_smi("35, 10240\n87, 2048\n").unwrap();
        assert_eq!(reading, ProbeReading { utilization: 87.0, secondary: 10240.0 });
        assert!(parse_nvidia_smi("").is_err());
        assert!(parse_nvidia_smi("[N/A], 100").is_err());
    }

    #[tokio::test]
    async fn test_cpu_probe_reads_memory() {
        let probe = CpuProbe::new();
        let reading = probe.sample().await.unwrap();
        assert!(reading.secondary > 0.0);
        assert_eq!(probe.device(), "cpu");
    }
}
