use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use crate::cli::{Arguments, MonitorDevice};

// External software
pub const DOCKER_TAG: &str = "docker";
pub const PBRUN_TAG: &str = "pbrun";
pub const FQ2BAM_TAG: &str = "fq2bam";
pub const HAPLOTYPECALLER_TAG: &str = "haplotypecaller";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const CONDA_TAG: &str = "conda";
pub const NVIDIA_SMI_TAG: &str = "nvidia-smi";
pub const IOSTAT_TAG: &str = "iostat";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Flagstat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    Stats,
}

// Static Filenames
pub const METRICS_FILE_SUFFIX: &str = "_metrics.csv";
pub const INSERT_SIZE_REPORT: &str = "insert_size.txt";
pub const GC_BIAS_REPORT: &str = "gcbias_summary.txt";
pub const QUALITY_BY_CYCLE_REPORT: &str = "mean_quality_by_cycle.txt";
pub const REALCLOCK_HEADER: &str = "Real Clock Duration (sec)";

// Static Parameters
pub const NA_TOKEN: &str = "NA";
pub const NO_CONDA_ENV: &str = "none";
pub const BWA_OPTIONS: &str = "-K 1000000";

// Container mount points
pub const MOUNT_FASTQ: &str = "/data/fastq";
pub const MOUNT_INPUT: &str = "/data/input";
pub const MOUNT_REFERENCE: &str = "/data/reference";
pub const MOUNT_OUTPUT: &str = "/data/output";
pub const MOUNT_METRICS: &str = "/data/metrics";
pub const MOUNT_TMP: &str = "/data/tmp";


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cannot read sample manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tool execution failed for {tool}: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Required metrics unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}


/// Terminal state of one sample's run through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Completed,
    Skipped(String),
    Failed { step: String, reason: String },
}


/// How long the background monitor keeps sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorWindow {
    /// Sample for exactly this long, regardless of when the stages finish.
    Fixed(Duration),
    /// Sample until the foreground signals completion, optionally capped.
    UntilStopped { max: Option<Duration> },
}


pub struct RunConfig {
    pub manifest: PathBuf,
    pub fastq_dir: PathBuf,
    pub alignment_dir: PathBuf,
    pub vcf_dir: PathBuf,
    pub log_dir: PathBuf,
    pub quality_dir: PathBuf,
    pub tmp_root: PathBuf,
    pub reference: PathBuf,
    pub out_dir: PathBuf,
    pub image: String,
    pub conda_env: Option<String>,
    pub threads: usize,
    pub gpus: usize,
    pub concurrent: usize,
    pub low_memory: bool,
    pub read_length: u64,
    pub monitor_device: MonitorDevice,
    pub monitor_window: MonitorWindow,
    pub monitor_interval: Duration,
    pub exclusive_accelerator: bool,
    pub disk_io_samples: u32,
    pub keep_tmp: bool,
    pub remove_bam: bool,
}

impl RunConfig {
    /// Resolves every relative path in `args` against `cwd`.
    pub fn from_args(args: &Arguments, cwd: &Path) -> Self {
        let resolve = |p: &str| {
            let path = PathBuf::from(p);
            if path.is_absolute() { path } else { cwd.join(path) }
        };

        let monitor_max = Duration::from_secs(args.monitor_secs);
        let monitor_window = if args.monitor_until_done {
            MonitorWindow::UntilStopped { max: Some(monitor_max) }
        } else {
            MonitorWindow::Fixed(monitor_max)
        };

        let conda_env = match args.conda_env.trim() {
            "" | NO_CONDA_ENV => None,
            env => Some(env.to_string()),
        };

        RunConfig {
            manifest: resolve(&args.samples),
            fastq_dir: resolve(&args.fastq_dir),
            alignment_dir: resolve(&args.alignment_dir),
            vcf_dir: resolve(&args.vcf_dir),
            log_dir: resolve(&args.log_dir),
            quality_dir: resolve(&args.quality_dir),
            tmp_root: resolve(&args.tmp_dir),
            reference: resolve(&args.reference),
            out_dir: args.out_dir.as_deref().map(resolve).unwrap_or_else(|| cwd.to_path_buf()),
            image: args.image.clone(),
            conda_env,
            threads: args.threads,
            gpus: args.gpus,
            concurrent: args.concurrent,
            low_memory: args.low_memory,
            read_length: args.read_length,
            monitor_device: args.monitor_device,
            monitor_window,
            monitor_interval: Duration::from_millis(args.monitor_interval_ms.max(1)),
            exclusive_accelerator: args.exclusive_accelerator,
            disk_io_samples: args.disk_io_samples,
            keep_tmp: args.keep_tmp,
            remove_bam: args.remove_bam,
        }
    }
}
