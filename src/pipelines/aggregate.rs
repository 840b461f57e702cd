// src/pipelines/aggregate.rs: merging per-sample metrics into batch reports

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use crate::config::defs::{METRICS_FILE_SUFFIX, NA_TOKEN, REALCLOCK_HEADER};
use crate::utils::metrics::MetricsRecord;


/// Merged multi-sample table. Every row has exactly `header.len()` fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends rows described by `header`, matching columns by name.
    /// Columns unknown so far extend the header and pad earlier rows with NA.
    pub fn add_table(&mut self, source: &str, header: &[String], rows: &[Vec<String>]) {
        for column in header {
            if !self.header.contains(column) {
                if !self.header.is_empty() {
                    warn!("{} adds column '{}'; earlier rows padded with {}", source, column, NA_TOKEN);
                }
                self.header.push(column.clone());
                for row in self.rows.iter_mut() {
                    row.push(NA_TOKEN.to_string());
                }
            }
        }

        let missing: Vec<&String> = self.header.iter().filter(|c| !header.contains(c)).collect();
        if !missing.is_empty() {
            warn!("{} lacks columns {:?}; filled with {}", source, missing, NA_TOKEN);
        }

        for row in rows {
            if row.len() != header.len() {
                warn!("{} has a row with {} fields for {} columns", source, row.len(), header.len());
            }
            let merged = self
                .header
                .iter()
                .map(|column| {
                    header
                        .iter()
                        .position(|h| h == column)
                        .and_then(|i| row.get(i))
                        .cloned()
                        .unwrap_or_else(|| NA_TOKEN.to_string())
                })
                .collect();
            self.rows.push(merged);
        }
    }

    pub fn record(&self, index: usize) -> Option<MetricsRecord> {
        self.rows.get(index).map(|row| MetricsRecord::from_row(&self.header, row))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}


/// Header plus data rows of a CSV file, or None when it holds nothing.
fn read_table(path: &Path) -> Result<Option<(Vec<String>, Vec<Vec<String>>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut records = reader.records();
    let header: Vec<String> = match records.next() {
        Some(record) => record?.iter().map(|f| f.trim().to_string()).collect(),
        None => return Ok(None),
    };
    let rows = records
        .map(|r| r.map(|record| record.iter().map(str::to_string).collect()))
        .collect::<Result<Vec<Vec<String>>, csv::Error>>()?;
    Ok(Some((header, rows)))
}

pub fn read_metrics_file(path: &Path) -> Result<MetricsRecord> {
    MetricsRecord::read_csv(path)
}

fn metrics_files(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(METRICS_FILE_SUFFIX))
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Concatenates every `*_metrics.csv` under `log_dir`, in file name order.
pub fn merge_metrics(log_dir: &Path) -> Result<BatchReport> {
    let mut report = BatchReport::new();
    if !log_dir.is_dir() {
        warn!("Metrics directory {} does not exist; nothing to merge", log_dir.display());
        return Ok(report);
    }

    for path in metrics_files(log_dir)? {
        let source = path.display().to_string();
        match read_table(&path) {
            Ok(Some((header, rows))) if !rows.is_empty() => report.add_table(&source, &header, &rows),
            Ok(_) => warn!("Skipping empty metrics file {}", source),
            Err(e) => warn!("Skipping unreadable metrics file {}: {}", source, e),
        }
    }
    debug!("Merged {} rows with {} columns", report.rows.len(), report.header.len());
    Ok(report)
}


pub fn merged_report_name(threads: usize, gpus: usize, concurrent: usize) -> String {
    format!("processing_metrics_t{}g{}c{}.csv", threads, gpus, concurrent)
}

/// `<dir>/<stem>_realclock.csv` next to the merged report.
pub fn realclock_path(merged: &Path) -> PathBuf {
    let stem = merged
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "processing_metrics".to_string());
    merged.with_file_name(format!("{}_realclock.csv", stem))
}

pub fn write_realclock(merged: &Path, seconds: f64) -> Result<PathBuf> {
    let path = realclock_path(merged);
    let mut writer = csv::Writer::from_path(&path)
        .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
    writer.write_record([REALCLOCK_HEADER])?;
    writer.write_record([format!("{:.2}", seconds)])?;
    writer.flush()?;
    info!("Real clock duration {:.2}s written to {}", seconds, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::utils::metrics::{keys, MetricValue};

    fn strings(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_column_padded_with_na() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("A_metrics.csv"), "Sample,Reads Processed,GC Bias\nA,100,0.9\n")?;
        fs::write(dir.path().join("B_metrics.csv"), "Sample,Reads Processed\nB,200\n")?;
        fs::write(dir.path().join("C_metrics.csv"), "Sample,Reads Processed,GC Bias\nC,300,1.1\n")?;

        let report = merge_metrics(dir.path())?;
        assert_eq!(report.header, strings(&["Sample", "Reads Processed", "GC Bias"]));
        assert_eq!(report.rows, vec![
            strings(&["A", "100", "0.9"]),
            strings(&["B", "200", "NA"]),
            strings(&["C", "300", "1.1"]),
        ]);
        Ok(())
    }

    #[test]
    fn test_new_column_extends_header() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("A_metrics.csv"), "Sample,Reads Processed\nA,100\n")?;
        fs::write(dir.path().join("B_metrics.csv"), "Sample,Mean Quality,Reads Processed\nB,35.5,200\n")?;

        let report = merge_metrics(dir.path())?;
        assert_eq!(report.header, strings(&["Sample", "Reads Processed", "Mean Quality"]));
        assert_eq!(report.rows[0], strings(&["A", "100", "NA"]));
        assert_eq!(report.rows[1], strings(&["B", "200", "35.5"]));
        Ok(())
    }

    #[test]
    fn test_skips_empty_and_unrelated_files() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("A_metrics.csv"), "")?;
        fs::write(dir.path().join("B_metrics.csv"), "Sample\n")?;
        fs::write(dir.path().join("notes.txt"), "Sample\nX\n")?;
        fs::write(dir.path().join("C_metrics.csv"), "Sample,Reads Processed\nC,1\n")?;

        let report = merge_metrics(dir.path())?;
        assert_eq!(report.rows, vec![strings(&["C", "1"])]);
        Ok(())
    }

    #[test]
    fn test_missing_dir_gives_empty_report() -> Result<()> {
        let report = merge_metrics(Path::new("/nonexistent/logs"))?;
        assert!(report.is_empty());
        assert!(report.header.is_empty());
        Ok(())
    }

    #[test]
    fn test_merged_rows_round_trip_to_records() -> Result<()> {
        let dir = tempdir()?;
        let mut record = MetricsRecord::for_sample("S1");
        record.set_number(keys::ALIGNMENT_RATE, 90.0);
        record.set_number(keys::PEAK_UTILIZATION, 71.0);
        record.set(keys::MONITOR_DEVICE, MetricValue::Text("gpu".to_string()));
        record.write_csv(&dir.path().join("S1_metrics.csv"))?;

        let report = merge_metrics(dir.path())?;
        let merged = dir.path().join("out").join(merged_report_name(8, 1, 4));
        report.write_csv(&merged)?;

        let from_report = report.record(0).ok_or_else(|| anyhow!("no row"))?;
        let from_file = read_metrics_file(&merged)?;
        assert_eq!(from_report.present_keys(), record.present_keys());
        for key in record.present_keys() {
            assert_eq!(from_report.get(key), record.get(key), "mismatch for {}", key);
            assert_eq!(from_file.get(key), record.get(key), "mismatch for {}", key);
        }
        Ok(())
    }

    #[test]
    fn test_realclock_report() -> Result<()> {
        let dir = tempdir()?;
        let merged = dir.path().join(merged_report_name(16, 2, 3));
        assert!(merged.ends_with("processing_metrics_t16g2c3.csv"));

        let path = write_realclock(&merged, 12.345)?;
        assert!(path.ends_with("processing_metrics_t16g2c3_realclock.csv"));
        assert_eq!(fs::read_to_string(path)?, "Real Clock Duration (sec)\n12.35\n");
        Ok(())
    }
}
