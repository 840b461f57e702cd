// src/pipelines/batch.rs: dispatching a batch of samples
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use crate::config::defs::{PipelineError, RunConfig, SampleOutcome};
use crate::pipelines::aggregate::{merge_metrics, merged_report_name, write_realclock, BatchReport};
use crate::pipelines::sample::SampleOrchestrator;
use crate::utils::file::read_manifest;
use crate::utils::monitor::HardwareProbe;
use crate::utils::stage::StageExecutor;


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    fn count(&mut self, outcome: &SampleOutcome) {
        match outcome {
            SampleOutcome::Completed => self.completed += 1,
            SampleOutcome::Skipped(_) => self.skipped += 1,
            SampleOutcome::Failed { .. } => self.failed += 1,
        }
    }
}


/// Runs at most `concurrency` samples at once. One sample's failure, or
/// panic, never stops its siblings.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    concurrency: usize,
}

impl BatchScheduler {
    pub fn new(concurrency: usize) -> Self {
        if concurrency == 0 {
            warn!("Concurrency of 0 requested; running one sample at a time");
        }
        BatchScheduler { concurrency: concurrency.max(1) }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<E, P>(&self, samples: &[String], orchestrator: &SampleOrchestrator<E, P>) -> BatchSummary
    where
        E: StageExecutor,
        P: HardwareProbe,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(samples.len());

        for sample in samples {
            let semaphore = semaphore.clone();
            let orchestrator = orchestrator.clone();
            let sample = sample.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Other(anyhow::anyhow!("Scheduler closed: {}", e)))?;
                debug!("Dispatching {}", sample);
                orchestrator.process(&sample).await
            }));
        }

        let mut summary = BatchSummary::default();
        for (sample, joined) in samples.iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(outcome)) => summary.count(&outcome),
                Ok(Err(e)) => {
                    error!("Sample {} ended with an error: {}", sample, e);
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("Sample {} task panicked: {}", sample, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}


/// Checks made once, before any sample is dispatched.
pub fn validate_setup(config: &RunConfig) -> Result<(), PipelineError> {
    if !config.reference.exists() {
        return Err(PipelineError::InvalidConfig(format!(
            "Reference FASTA not found: {}",
            config.reference.display()
        )));
    }
    std::fs::create_dir_all(&config.log_dir).map_err(|e| {
        PipelineError::InvalidConfig(format!("Cannot create log directory {}: {}", config.log_dir.display(), e))
    })?;
    Ok(())
}


#[derive(Debug)]
pub struct BatchOutputs {
    pub summary: BatchSummary,
    pub report: BatchReport,
    pub merged_path: PathBuf,
    pub realclock_path: PathBuf,
}

/// Whole batch: setup checks, bounded dispatch, then the merged and real
/// clock reports. Only setup and report-writing problems are errors.
pub async fn run<E, P>(config: Arc<RunConfig>, executor: Arc<E>, probe: Arc<P>) -> Result<BatchOutputs, PipelineError>
where
    E: StageExecutor,
    P: HardwareProbe,
{
    let start = Instant::now();
    validate_setup(&config)?;

    let samples = read_manifest(&config.manifest)?;
    if samples.is_empty() {
        warn!("No samples listed in {}", config.manifest.display());
    }
    info!(
        "Processing {} samples, {} at a time, monitoring {}",
        samples.len(),
        config.concurrent,
        probe.device()
    );

    let orchestrator = SampleOrchestrator::new(config.clone(), executor, probe);
    let summary = BatchScheduler::new(config.concurrent).run(&samples, &orchestrator).await;
    info!(
        "Batch finished: {} completed, {} skipped, {} failed",
        summary.completed, summary.skipped, summary.failed
    );

    let report = merge_metrics(&config.log_dir)?;
    let merged_path = config
        .out_dir
        .join(merged_report_name(config.threads, config.gpus, config.concurrent));
    report.write_csv(&merged_path)?;
    info!("Merged {} sample rows into {}", report.rows.len(), merged_path.display());

    let realclock_path = write_realclock(&merged_path, start.elapsed().as_secs_f64())?;

    Ok(BatchOutputs { summary, report, merged_path, realclock_path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;
    use clap::Parser;
    use tempfile::tempdir;
    use crate::cli::Arguments;
    use crate::utils::monitor::ProbeReading;
    use crate::utils::stage::{StageResult, StageSpec};

    struct NoopExecutor;

    impl StageExecutor for NoopExecutor {
        fn execute(&self, _spec: &StageSpec) -> impl Future<Output = StageResult> + Send {
            std::future::ready(StageResult::succeeded(String::new(), Duration::ZERO))
        }
    }

    struct IdleProbe;

    impl HardwareProbe for IdleProbe {
        fn sample(&self) -> impl Future<Output = anyhow::Result<ProbeReading>> + Send {
            std::future::ready(Ok(ProbeReading { utilization: 0.0, secondary: 0.0 }))
        }

        fn device(&self) -> &'static str {
            "gpu"
        }
    }

    fn config_in(dir: &std::path::Path, extra: &[&str]) -> Arc<RunConfig> {
        let mut argv = vec!["seqbench-pipelines", "--monitor-until-done", "--disk-io-samples", "0"];
        argv.extend_from_slice(extra);
        Arc::new(RunConfig::from_args(&Arguments::parse_from(argv), dir))
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        assert_eq!(BatchScheduler::new(0).concurrency(), 1);
        assert_eq!(BatchScheduler::new(6).concurrency(), 6);
    }

    #[test]
    fn test_missing_reference_is_invalid_config() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path(), &[]);
        let err = validate_setup(&config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_setup_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = config_in(dir.path(), &[]);
        std::fs::create_dir_all(config.reference.parent().unwrap())?;
        std::fs::write(&config.reference, ">chr1\nACGT\n")?;

        let err = run(config, Arc::new(NoopExecutor), Arc::new(IdleProbe)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Manifest { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_samples_without_inputs_are_all_skipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = config_in(dir.path(), &["--concurrent", "2"]);
        let orchestrator = SampleOrchestrator::new(config, Arc::new(NoopExecutor), Arc::new(IdleProbe));
        let samples: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();

        let summary = BatchScheduler::new(2).run(&samples, &orchestrator).await;
        assert_eq!(summary, BatchSummary { completed: 0, skipped: 3, failed: 0 });
        assert_eq!(summary.total(), samples.len());
        Ok(())
    }
}
