use std::sync::Arc;
use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use crate::config::defs::{PipelineError, RunConfig, SampleOutcome, FQ2BAM_TAG, HAPLOTYPECALLER_TAG};
use crate::utils::command::parabricks::{self, Fq2BamParams, HaplotypeCallerParams};
use crate::utils::command::{bcftools, owner_of, samtools};
use crate::utils::extract::{alignment_rate, parse_flagstat, parse_variant_count, MetricsExtractor, StageKind};
use crate::utils::file::{count_fastq_records, remove_quietly, SamplePaths};
use crate::utils::metrics::{keys, MetricValue, MetricsRecord};
use crate::utils::monitor::{HardwareProbe, ResourceMonitor};
use crate::utils::quality::parse_quality_reports;
use crate::utils::stage::{StageExecutor, StageResult};
use crate::utils::system::{cpu_ram_snapshot, disk_io_peaks};


fn failed(step: &str, err: PipelineError) -> SampleOutcome {
    SampleOutcome::Failed { step: step.to_string(), reason: err.to_string() }
}

fn stage_failed(step: &str, result: &StageResult) -> SampleOutcome {
    let error = result
        .error_detail
        .clone()
        .unwrap_or_else(|| result.combined_output.clone());
    failed(step, PipelineError::ToolExecution { tool: step.to_string(), error })
}


/// Drives one sample through
/// input check -> fq2bam (+ monitor) -> haplotypecaller -> derived metrics
/// -> QC reports -> per-sample metrics file.
///
/// A failed stage ends the sample; nothing is retried. The metrics file is
/// only written for samples that reach the end.
pub struct SampleOrchestrator<E, P> {
    config: Arc<RunConfig>,
    executor: Arc<E>,
    probe: Arc<P>,
    extractor: Arc<MetricsExtractor>,
    accelerator_gate: Option<Arc<Semaphore>>,
}

impl<E, P> Clone for SampleOrchestrator<E, P> {
    fn clone(&self) -> Self {
        SampleOrchestrator {
            config: self.config.clone(),
            executor: self.executor.clone(),
            probe: self.probe.clone(),
            extractor: self.extractor.clone(),
            accelerator_gate: self.accelerator_gate.clone(),
        }
    }
}

impl<E: StageExecutor, P: HardwareProbe> SampleOrchestrator<E, P> {
    pub fn new(config: Arc<RunConfig>, executor: Arc<E>, probe: Arc<P>) -> Self {
        // One permit shared by every clone: with --exclusive-accelerator only
        // one sample at a time runs its stages under the monitor.
        let accelerator_gate = config.exclusive_accelerator.then(|| Arc::new(Semaphore::new(1)));
        SampleOrchestrator {
            config,
            executor,
            probe,
            extractor: Arc::new(MetricsExtractor::default()),
            accelerator_gate,
        }
    }

    pub fn with_extractor(mut self, extractor: MetricsExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub async fn process(&self, sample_id: &str) -> Result<SampleOutcome, PipelineError> {
        let paths = SamplePaths::new(&self.config, sample_id);
        // A previous run's file must not be merged as this run's result.
        remove_quietly(&paths.metrics_file);

        let outcome = self.run_pipeline(sample_id, &paths).await;

        if !self.config.keep_tmp {
            remove_quietly(&paths.tmp_dir);
        }

        match &outcome {
            Ok(SampleOutcome::Completed) => info!("Sample {} complete: {}", sample_id, paths.metrics_file.display()),
            Ok(SampleOutcome::Skipped(reason)) => warn!("Skipping {}: {}", sample_id, reason),
            Ok(SampleOutcome::Failed { step, reason }) => error!("Sample {} failed at {}: {}", sample_id, step, reason),
            Err(e) => error!("Sample {} aborted: {}", sample_id, e),
        }
        outcome
    }

    async fn run_pipeline(&self, sample_id: &str, paths: &SamplePaths) -> Result<SampleOutcome, PipelineError> {
        let config = &self.config;

        let missing = paths.missing_inputs();
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            return Ok(SampleOutcome::Skipped(format!("FASTQ files missing: {}", missing.join(", "))));
        }

        paths.create_output_dirs().map_err(|e| PipelineError::IOError(e.to_string()))?;
        info!(
            "Processing {} with {} threads, {} GPUs, low_memory={}.",
            sample_id, config.threads, config.gpus, config.low_memory
        );

        let mut record = MetricsRecord::for_sample(sample_id);

        let fastq1 = paths.fastq1.clone();
        let total_reads = match tokio::task::spawn_blocking(move || count_fastq_records(&fastq1)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Ok(failed("read_count", PipelineError::Other(e))),
            Err(e) => return Err(PipelineError::Other(anyhow!("Read count task failed: {}", e))),
        };
        record.set_number(keys::READS_PROCESSED, total_reads as f64);
        record.set_number(keys::BASES_PROCESSED, (total_reads * config.read_length) as f64);

        let user = owner_of(&paths.tmp_dir);

        let gate = match &self.accelerator_gate {
            Some(gate) => Some(
                gate.clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Other(anyhow!("Accelerator gate closed: {}", e)))?,
            ),
            None => None,
        };
        let monitor = ResourceMonitor::new(config.monitor_window, config.monitor_interval).spawn(self.probe.clone());

        let fq2bam = parabricks::fq2bam(&Fq2BamParams {
            sample_id: sample_id.to_string(),
            fastq1: paths.fastq1.clone(),
            fastq2: Some(paths.fastq2.clone()),
            reference: config.reference.clone(),
            output_bam: paths.bam.clone(),
            qc_metrics_dir: paths.qc_dir.clone(),
            tmp_dir: paths.tmp_dir.clone(),
            num_gpus: config.gpus,
            num_threads: config.threads,
            low_memory: config.low_memory,
            image: config.image.clone(),
            user: user.clone(),
        });
        let result = self.executor.execute(&fq2bam).await;
        record.set_number(keys::FQ2BAM_TIME, result.elapsed.as_secs_f64());
        if !result.success {
            monitor.abandon();
            return Ok(stage_failed(FQ2BAM_TAG, &result));
        }
        record.merge(self.extractor.extract_stage(StageKind::Alignment, &result.combined_output));
        drop(result);

        let haplotypecaller = parabricks::haplotypecaller(&HaplotypeCallerParams {
            input_bam: paths.bam.clone(),
            reference: config.reference.clone(),
            output_vcf: paths.vcf.clone(),
            tmp_dir: paths.tmp_dir.clone(),
            num_gpus: config.gpus,
            image: config.image.clone(),
            user,
        });
        let result = self.executor.execute(&haplotypecaller).await;
        record.set_number(keys::HAPLOTYPECALLER_TIME, result.elapsed.as_secs_f64());
        if !result.success {
            monitor.abandon();
            return Ok(stage_failed(HAPLOTYPECALLER_TAG, &result));
        }
        record.merge(self.extractor.extract_stage(StageKind::VariantCalling, &result.combined_output));
        drop(result);

        let peaks = monitor.finish().await;
        drop(gate);
        debug!("{} peaks for {}: {:?}", self.probe.device(), sample_id, peaks);
        record.set(keys::MONITOR_DEVICE, MetricValue::Text(self.probe.device().to_string()));
        record.set_opt(keys::PEAK_UTILIZATION, peaks.utilization);
        record.set_opt(keys::PEAK_MEMORY, peaks.secondary);

        let conda_env = config.conda_env.as_deref();
        let flagstat = self.executor.execute(&samtools::flagstat(&paths.bam, conda_env)).await;
        if !flagstat.success {
            return Ok(stage_failed("flagstat", &flagstat));
        }
        let counts = parse_flagstat(&flagstat.combined_output);
        let (Some(total), Some(properly_paired)) = (counts.total, counts.properly_paired) else {
            return Ok(failed(
                "alignment_rate",
                PipelineError::MetricsUnavailable(format!("could not parse flagstat output for {}", paths.bam.display())),
            ));
        };
        record.set_number(keys::ALIGNMENT_RATE, alignment_rate(total, properly_paired));

        let stats = self.executor.execute(&bcftools::stats(&paths.vcf, conda_env)).await;
        if stats.success {
            record.set_opt(keys::VARIANTS_CALLED, parse_variant_count(&stats.combined_output).map(|n| n as f64));
        } else {
            warn!(
                "Error counting variants in {}: {}",
                paths.vcf.display(),
                stats.error_detail.unwrap_or_default()
            );
        }

        let (cpu, ram) = cpu_ram_snapshot().await;
        record.set_opt(keys::CPU_USAGE, cpu);
        record.set_opt(keys::RAM_USAGE, ram);

        if config.disk_io_samples > 0 {
            let (read, write) = disk_io_peaks(sample_id, config.disk_io_samples).await;
            record.set_opt(keys::DISK_READ_SPEED, read);
            record.set_opt(keys::DISK_WRITE_SPEED, write);
        }

        record.merge(parse_quality_reports(&paths.qc_dir));

        record
            .write_csv(&paths.metrics_file)
            .map_err(|e| PipelineError::IOError(e.to_string()))?;

        if config.remove_bam {
            remove_quietly(&paths.bam);
        }
        Ok(SampleOutcome::Completed)
    }
}
