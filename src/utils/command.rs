/// Functions and structs for building the external stage command lines

use std::path::Path;
use anyhow::{anyhow, Result};
use crate::config::defs::{CONDA_TAG, DOCKER_TAG};
use crate::utils::stage::StageSpec;


fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_dir(path: &Path) -> String {
    path.parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

fn volume(host: impl AsRef<str>, container: &str) -> [String; 2] {
    ["-v".to_string(), format!("{}:{}", host.as_ref(), container)]
}

/// Prefixes a tool invocation with `conda run -n <env>` when an env is set.
fn in_conda_env(name: &str, tool: &str, conda_env: Option<&str>) -> StageSpec {
    match conda_env {
        Some(env) => StageSpec::new(name, CONDA_TAG).args(["run", "-n", env, tool]),
        None => StageSpec::new(name, tool),
    }
}


pub mod parabricks {
    use std::path::PathBuf;
    use crate::config::defs::{
        BWA_OPTIONS, DOCKER_TAG, FQ2BAM_TAG, HAPLOTYPECALLER_TAG, MOUNT_FASTQ, MOUNT_INPUT, MOUNT_METRICS,
        MOUNT_OUTPUT, MOUNT_REFERENCE, MOUNT_TMP, PBRUN_TAG,
    };
    use crate::utils::stage::StageSpec;
    use super::{file_name, parent_dir, volume};

    #[derive(Debug, Clone)]
    pub struct Fq2BamParams {
        pub sample_id: String,
        pub fastq1: PathBuf,
        pub fastq2: Option<PathBuf>,
        pub reference: PathBuf,
        pub output_bam: PathBuf,
        pub qc_metrics_dir: PathBuf,
        pub tmp_dir: PathBuf,
        pub num_gpus: usize,
        pub num_threads: usize,
        pub low_memory: bool,
        pub image: String,
        pub user: Option<String>,
    }

    #[derive(Debug, Clone)]
    pub struct HaplotypeCallerParams {
        pub input_bam: PathBuf,
        pub reference: PathBuf,
        pub output_vcf: PathBuf,
        pub tmp_dir: PathBuf,
        pub num_gpus: usize,
        pub image: String,
        pub user: Option<String>,
    }

    fn docker_prefix(name: &str, user: Option<&str>) -> StageSpec {
        let spec = StageSpec::new(name, DOCKER_TAG).args(["run", "--rm", "--gpus", "all"]);
        match user {
            Some(user) => spec.args(["--user", user]),
            None => spec,
        }
    }

    pub fn fq2bam_log(params: &Fq2BamParams) -> PathBuf {
        params.tmp_dir.join(format!("{}_fq2bam.log", params.sample_id))
    }

    pub fn haplotypecaller_log(params: &HaplotypeCallerParams) -> PathBuf {
        params.tmp_dir.join(format!("{}_hc.log", file_name(&params.input_bam)))
    }

    pub fn fq2bam(params: &Fq2BamParams) -> StageSpec {
        let log_file = fq2bam_log(params);

        let mut spec = docker_prefix(FQ2BAM_TAG, params.user.as_deref())
            .args(volume(parent_dir(&params.fastq1), MOUNT_FASTQ))
            .args(volume(parent_dir(&params.reference), MOUNT_REFERENCE))
            .args(volume(parent_dir(&params.output_bam), MOUNT_OUTPUT))
            .args(volume(params.qc_metrics_dir.to_string_lossy(), MOUNT_METRICS))
            .args(volume(params.tmp_dir.to_string_lossy(), MOUNT_TMP))
            .arg(params.image.as_str())
            .args([PBRUN_TAG, FQ2BAM_TAG])
            .arg("--ref")
            .arg(format!("{}/{}", MOUNT_REFERENCE, file_name(&params.reference)))
            .arg("--in-fq")
            .arg(format!("{}/{}", MOUNT_FASTQ, file_name(&params.fastq1)));

        if let Some(fastq2) = &params.fastq2 {
            spec = spec.arg(format!("{}/{}", MOUNT_FASTQ, file_name(fastq2)));
        }

        spec = spec
            .arg("--out-bam")
            .arg(format!("{}/{}", MOUNT_OUTPUT, file_name(&params.output_bam)))
            .arg("--num-gpus")
            .arg(params.num_gpus.to_string())
            .arg("--bwa-cpu-thread-pool")
            .arg(params.num_threads.to_string())
            .args(["--out-qc-metrics-dir", MOUNT_METRICS, "--tmp-dir", MOUNT_TMP])
            .args(["--bwa-options", BWA_OPTIONS])
            .arg("--verbose")
            .arg("--logfile")
            .arg(format!("{}/{}", MOUNT_TMP, file_name(&log_file)));

        if params.low_memory {
            spec = spec.arg("--low-memory");
        }

        spec.output(params.output_bam.clone()).side_log(log_file)
    }

    pub fn haplotypecaller(params: &HaplotypeCallerParams) -> StageSpec {
        let log_file = haplotypecaller_log(params);

        docker_prefix(HAPLOTYPECALLER_TAG, params.user.as_deref())
            .args(volume(parent_dir(&params.input_bam), MOUNT_INPUT))
            .args(volume(parent_dir(&params.reference), MOUNT_REFERENCE))
            .args(volume(parent_dir(&params.output_vcf), MOUNT_OUTPUT))
            .args(volume(params.tmp_dir.to_string_lossy(), MOUNT_TMP))
            .arg(params.image.as_str())
            .args([PBRUN_TAG, HAPLOTYPECALLER_TAG])
            .arg("--ref")
            .arg(format!("{}/{}", MOUNT_REFERENCE, file_name(&params.reference)))
            .arg("--in-bam")
            .arg(format!("{}/{}", MOUNT_INPUT, file_name(&params.input_bam)))
            .arg("--out-variants")
            .arg(format!("{}/{}", MOUNT_OUTPUT, file_name(&params.output_vcf)))
            .arg("--num-gpus")
            .arg(params.num_gpus.to_string())
            .args(["--tmp-dir", MOUNT_TMP, "--verbose"])
            .arg("--logfile")
            .arg(format!("{}/{}", MOUNT_TMP, file_name(&log_file)))
            .output(params.output_vcf.clone())
            .side_log(log_file)
    }
}


pub mod samtools {
    use std::path::Path;
    use crate::config::defs::{SamtoolsSubcommand, SAMTOOLS_TAG};
    use crate::utils::stage::StageSpec;
    use super::in_conda_env;

    pub fn subcommand(sub: SamtoolsSubcommand) -> &'static str {
        match sub {
            SamtoolsSubcommand::Flagstat => "flagstat",
        }
    }

    pub fn flagstat(bam: &Path, conda_env: Option<&str>) -> StageSpec {
        in_conda_env("flagstat", SAMTOOLS_TAG, conda_env)
            .arg(subcommand(SamtoolsSubcommand::Flagstat))
            .arg(bam.to_string_lossy())
    }
}


pub mod bcftools {
    use std::path::Path;
    use crate::config::defs::{BcftoolsSubcommand, BCFTOOLS_TAG};
    use crate::utils::stage::StageSpec;
    use super::in_conda_env;

    pub fn subcommand(sub: BcftoolsSubcommand) -> &'static str {
        match sub {
            BcftoolsSubcommand::Stats => "stats",
        }
    }

    pub fn stats(vcf: &Path, conda_env: Option<&str>) -> StageSpec {
        in_conda_env("bcftools_stats", BCFTOOLS_TAG, conda_env)
            .arg(subcommand(BcftoolsSubcommand::Stats))
            .arg(vcf.to_string_lossy())
    }
}


async fn docker_presence_check() -> Result<String> {
    let output = tokio::process::Command::new(DOCKER_TAG)
        .arg("--version")
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is docker installed?", DOCKER_TAG, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout
        .lines()
        .next()
        .ok_or_else(|| anyhow!("No output from docker --version"))?;
    // Docker version 24.0.5, build ced0996
    let version = first_line
        .split_whitespace()
        .nth(2)
        .map(|v| v.trim_end_matches(','))
        .ok_or_else(|| anyhow!("Invalid docker --version output: {}", first_line))?
        .to_string();
    if version.is_empty() {
        return Err(anyhow!("Empty version number in docker --version output: {}", first_line));
    }
    Ok(version)
}

pub async fn check_version(tool: &str) -> Result<String> {
    match tool {
        DOCKER_TAG => docker_presence_check().await,
        _ => Err(anyhow!("Unknown tool: {}", tool)),
    }
}

/// `uid:gid` owning `path`, used to run containers as the caller so outputs
/// are not root-owned.
#[cfg(unix)]
pub fn owner_of(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| format!("{}:{}", m.uid(), m.gid()))
}

#[cfg(not(unix))]
pub fn owner_of(_path: &Path) -> Option<String> {
    None
}
