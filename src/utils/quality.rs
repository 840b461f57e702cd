/// Parsers for the QC reports fq2bam writes into `--out-qc-metrics-dir`.
use std::fs;
use std::path::Path;
use anyhow::{anyhow, Result};
use log::{debug, error};
use crate::config::defs::{GC_BIAS_REPORT, INSERT_SIZE_REPORT, QUALITY_BY_CYCLE_REPORT};
use crate::utils::metrics::{keys, MetricsRecord};

const INSERT_SIZE_LABEL: &str = "MEAN_INSERT_SIZE";
const GC_BIAS_ROW_LABEL: &str = "All Reads";
const GC_BIAS_TOKEN: usize = 8; // GC_NC_40_59


/// Value on the line after the `MEAN_INSERT_SIZE` header. A later header
/// replaces an earlier one.
pub fn parse_insert_size(text: &str) -> Result<Option<f64>> {
    let lines: Vec<&str> = text.lines().collect();
    let mut value = None;
    for (i, line) in lines.iter().enumerate() {
        if line.contains(INSERT_SIZE_LABEL) && i + 1 < lines.len() {
            let token = lines[i + 1]
                .split_whitespace()
                .next()
                .ok_or_else(|| anyhow!("Empty line after {}", INSERT_SIZE_LABEL))?;
            value = Some(token.parse::<f64>()?);
        }
    }
    Ok(value)
}

pub fn parse_gc_bias(text: &str) -> Result<Option<f64>> {
    let mut value = None;
    for line in text.lines().filter(|l| l.starts_with(GC_BIAS_ROW_LABEL)) {
        let token = line
            .split_whitespace()
            .nth(GC_BIAS_TOKEN)
            .ok_or_else(|| anyhow!("'{}' row has fewer than {} fields", GC_BIAS_ROW_LABEL, GC_BIAS_TOKEN + 1))?;
        value = Some(token.parse::<f64>()?);
    }
    Ok(value)
}

/// Unweighted mean of the second column, skipping comments and the header
/// line. No data rows gives 0.
pub fn parse_mean_quality(text: &str) -> f64 {
    let mut header_passed = false;
    let mut qualities = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if !header_passed {
            header_passed = true;
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(q) = parts.get(1) {
            let is_numeric = !q.is_empty() && q.chars().all(|c| c.is_ascii_digit() || c == '.');
            if let (true, Ok(v)) = (is_numeric, q.parse::<f64>()) {
                qualities.push(v);
            }
        }
    }
    if qualities.is_empty() {
        0.0
    } else {
        qualities.iter().sum::<f64>() / qualities.len() as f64
    }
}

fn parse_report<T>(dir: &Path, name: &str, parse: impl Fn(&str) -> Result<T>) -> Option<T> {
    let path = dir.join(name);
    if !path.exists() {
        debug!("Quality report {} not present", path.display());
        return None;
    }
    match fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|text| parse(&text)) {
        Ok(v) => Some(v),
        Err(e) => {
            error!("Error parsing quality report {}: {}", path.display(), e);
            None
        }
    }
}

/// Reads the three QC reports under `quality_dir`. Each file contributes
/// independently; a missing or broken file leaves only its own key absent.
pub fn parse_quality_reports(quality_dir: &Path) -> MetricsRecord {
    let mut record = MetricsRecord::new();
    if let Some(v) = parse_report(quality_dir, INSERT_SIZE_REPORT, parse_insert_size).flatten() {
        record.set_number(keys::MEAN_INSERT_SIZE, v);
    }
    if let Some(v) = parse_report(quality_dir, GC_BIAS_REPORT, parse_gc_bias).flatten() {
        record.set_number(keys::GC_BIAS, v);
    }
    if let Some(v) = parse_report(quality_dir, QUALITY_BY_CYCLE_REPORT, |t| Ok(parse_mean_quality(t))) {
        record.set_number(keys::MEAN_QUALITY, v);
    }
    record
}
