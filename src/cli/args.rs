use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum MonitorDevice {
    #[default]
    Gpu,
    Cpu,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "seqbench-pipelines", version, about = "Batch fq2bam + haplotypecaller runs with resource monitoring and merged metrics")]
pub struct Arguments {

    #[arg(long, default_value = "samples.txt", help = "Newline-delimited list of sample IDs")]
    pub samples: String,

    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    #[arg(long, default_value_t = 1)]
    pub gpus: usize,

    #[arg(long, default_value_t = 4, help = "Number of samples processed at the same time")]
    pub concurrent: usize,

    #[arg(long = "low-memory", action, help = "Enable low-memory mode for fq2bam")]
    pub low_memory: bool,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, default_value = "fastq_files")]
    pub fastq_dir: String,

    #[arg(long, default_value = "alignment")]
    pub alignment_dir: String,

    #[arg(long, default_value = "vcf_files")]
    pub vcf_dir: String,

    #[arg(long, default_value = "logs", help = "Per-sample metrics files are written here")]
    pub log_dir: String,

    #[arg(long, default_value = "quality_reports")]
    pub quality_dir: String,

    #[arg(long, default_value = "tmp", help = "Root of the per-sample temp directories")]
    pub tmp_dir: String,

    #[arg(long, default_value = "reference_genome/reference.fa")]
    pub reference: String,

    #[arg(short = 'o', long = "out", help = "Directory for the merged and real clock reports. Defaults to the current directory.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value = "nvcr.io/nvidia/clara/clara-parabricks:4.4.0-1")]
    pub image: String,

    #[arg(long, default_value = "bioinfo_env", help = "Conda env for samtools/bcftools; 'none' runs them directly")]
    pub conda_env: String,

    #[arg(long, default_value_t = 150)]
    pub read_length: u64,

    #[arg(long = "monitor-device", default_value = "gpu", value_enum)]
    pub monitor_device: MonitorDevice,

    #[arg(long, default_value_t = 180, help = "Monitoring window; upper bound when --monitor-until-done is set")]
    pub monitor_secs: u64,

    #[arg(long, default_value_t = 1000)]
    pub monitor_interval_ms: u64,

    #[arg(long, default_value_t = false, help = "Stop monitoring when the stages finish instead of after a fixed window")]
    pub monitor_until_done: bool,

    #[arg(long, default_value_t = false, help = "Serialize accelerator use across concurrent samples")]
    pub exclusive_accelerator: bool,

    #[arg(long, default_value_t = 30, help = "iostat samples per sample; 0 disables disk I/O collection")]
    pub disk_io_samples: u32,

    #[arg(long, default_value_t = false)]
    pub keep_tmp: bool,

    #[arg(long, default_value_t = false, help = "Delete the aligned BAM after a sample completes")]
    pub remove_bam: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_batch_script() {
        let args = Arguments::parse_from(["seqbench-pipelines"]);
        assert_eq!(args.samples, "samples.txt");
        assert_eq!(args.threads, 8);
        assert_eq!(args.gpus, 1);
        assert_eq!(args.concurrent, 4);
        assert!(!args.low_memory);
        assert_eq!(args.monitor_device, MonitorDevice::Gpu);
        assert_eq!(args.monitor_secs, 180);
        assert!(!args.monitor_until_done);
    }

    #[test]
    fn test_flags() {
        let args = Arguments::parse_from([
            "seqbench-pipelines",
            "--samples", "batch.txt",
            "--concurrent", "2",
            "--low-memory",
            "--monitor-device", "cpu",
            "--exclusive-accelerator",
        ]);
        assert_eq!(args.samples, "batch.txt");
        assert_eq!(args.concurrent, 2);
        assert!(args.low_memory);
        assert_eq!(args.monitor_device, MonitorDevice::Cpu);
        assert!(args.exclusive_accelerator);
    }
}
