use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use anyhow::Result;
use flate2::read::MultiGzDecoder;
use log::warn;
use crate::config::defs::{PipelineError, RunConfig, METRICS_FILE_SUFFIX};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    file.read_exact(&mut buffer)?;
    Ok(buffer == [0x1F, 0x8B]) // Gzip magic bytes
}


/// Sample IDs from manifest text: trimmed, blank lines dropped, first
/// occurrence of a duplicate kept.
pub fn parse_manifest(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut samples = Vec::new();
    for id in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if seen.insert(id.to_string()) {
            samples.push(id.to_string());
        } else {
            warn!("Duplicate sample {} in manifest; processing it once", id);
        }
    }
    samples
}

pub fn read_manifest(path: &Path) -> Result<Vec<String>, PipelineError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_manifest(&text))
}


pub fn metrics_file_path(log_dir: &Path, sample_id: &str) -> PathBuf {
    log_dir.join(format!("{}{}", sample_id, METRICS_FILE_SUFFIX))
}

/// Every on-disk location belonging to one sample. All of them are
/// namespaced by the sample ID so concurrent samples never collide.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePaths {
    pub fastq1: PathBuf,
    pub fastq2: PathBuf,
    pub bam: PathBuf,
    pub vcf: PathBuf,
    pub qc_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub metrics_file: PathBuf,
}

impl SamplePaths {
    pub fn new(config: &RunConfig, sample_id: &str) -> Self {
        let fastq_dir = config.fastq_dir.join(sample_id);
        SamplePaths {
            fastq1: fastq_dir.join(format!("{}_1.fastq.gz", sample_id)),
            fastq2: fastq_dir.join(format!("{}_2.fastq.gz", sample_id)),
            bam: config.alignment_dir.join(format!("{}_aligned.bam", sample_id)),
            vcf: config.vcf_dir.join(format!("{}.vcf", sample_id)),
            qc_dir: config.quality_dir.join(sample_id),
            tmp_dir: config.tmp_root.join(sample_id),
            metrics_file: metrics_file_path(&config.log_dir, sample_id),
        }
    }

    pub fn missing_inputs(&self) -> Vec<&Path> {
        [self.fastq1.as_path(), self.fastq2.as_path()]
            .into_iter()
            .filter(|p| !p.exists())
            .collect()
    }

    /// Directories the stages write into.
    pub fn create_output_dirs(&self) -> io::Result<()> {
        for path in [&self.bam, &self.vcf, &self.metrics_file] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&self.qc_dir)?;
        fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }
}


/// Number of FASTQ records in a plain or gzipped file.
pub fn count_fastq_records(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzipped(path)? {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut fastq = seq_io::fastq::Reader::new(reader);
    let mut count = 0u64;
    while let Some(record) = fastq.next() {
        record?;
        count += 1;
    }
    Ok(count)
}

/// Removes a file or directory tree, logging instead of failing.
pub fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = result {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}
