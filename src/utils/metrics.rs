/// The per-sample metrics record and its on-disk CSV form.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use anyhow::{anyhow, Result};
use crate::config::defs::NA_TOKEN;

pub mod keys {
    pub const SAMPLE: &str = "sample";
    pub const READS_PROCESSED: &str = "reads_processed";
    pub const BASES_PROCESSED: &str = "bases_processed";
    pub const FQ2BAM_TIME: &str = "fq2bam_time";
    pub const HAPLOTYPECALLER_TIME: &str = "haplotypecaller_time";
    pub const BWA_TIME: &str = "bwa_time";
    pub const SORTING_TIME: &str = "sorting_time";
    pub const BQSR_TIME: &str = "bqsr_time";
    pub const ALIGNMENT_RATE: &str = "alignment_rate";
    pub const VARIANTS_CALLED: &str = "variants_called";
    pub const REGIONS_PROCESSED: &str = "regions_processed";
    pub const REGIONS_PER_MINUTE: &str = "regions_per_minute";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const RAM_USAGE: &str = "ram_usage";
    pub const MONITOR_DEVICE: &str = "monitor_device";
    pub const PEAK_UTILIZATION: &str = "peak_utilization";
    pub const PEAK_MEMORY: &str = "peak_memory";
    pub const DISK_READ_SPEED: &str = "disk_read_speed";
    pub const DISK_WRITE_SPEED: &str = "disk_write_speed";
    pub const TIME_READING: &str = "time_reading";
    pub const MIN_RATE: &str = "min_rate";
    pub const MAX_RATE: &str = "max_rate";
    pub const AVG_RATE: &str = "avg_rate";
    pub const MONITOR_TIME: &str = "monitor_time";
    pub const MEAN_INSERT_SIZE: &str = "mean_insert_size";
    pub const GC_BIAS: &str = "gc_bias";
    pub const MEAN_QUALITY: &str = "mean_quality";
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnKind {
    Numeric,
    Text,
}

#[derive(Debug)]
pub struct MetricColumn {
    pub key: &'static str,
    pub header: &'static str,
    pub kind: ColumnKind,
}

const fn num(key: &'static str, header: &'static str) -> MetricColumn {
    MetricColumn { key, header, kind: ColumnKind::Numeric }
}

const fn text(key: &'static str, header: &'static str) -> MetricColumn {
    MetricColumn { key, header, kind: ColumnKind::Text }
}

/// Column order of the per-sample file.
pub const METRIC_COLUMNS: &[MetricColumn] = &[
    text(keys::SAMPLE, "Sample"),
    num(keys::READS_PROCESSED, "Reads Processed"),
    num(keys::BASES_PROCESSED, "Bases Processed"),
    num(keys::FQ2BAM_TIME, "fq2bam Time (sec)"),
    num(keys::HAPLOTYPECALLER_TIME, "HaplotypeCaller Time (sec)"),
    num(keys::BWA_TIME, "BWA Time (sec)"),
    num(keys::SORTING_TIME, "Sorting Time (sec)"),
    num(keys::BQSR_TIME, "BQSR Time (sec)"),
    num(keys::ALIGNMENT_RATE, "Alignment Rate (%)"),
    num(keys::VARIANTS_CALLED, "Variants Called"),
    num(keys::REGIONS_PROCESSED, "Regions Processed"),
    num(keys::REGIONS_PER_MINUTE, "Regions/Minute"),
    num(keys::CPU_USAGE, "CPU Usage (%)"),
    num(keys::RAM_USAGE, "RAM Usage (MB)"),
    text(keys::MONITOR_DEVICE, "Monitor Device"),
    num(keys::PEAK_UTILIZATION, "Peak Device Usage (%)"),
    num(keys::PEAK_MEMORY, "Peak Device Memory (MB)"),
    num(keys::DISK_READ_SPEED, "Disk Read Speed (MB/s)"),
    num(keys::DISK_WRITE_SPEED, "Disk Write Speed (MB/s)"),
    num(keys::TIME_READING, "Time Spent Reading (sec)"),
    num(keys::MIN_RATE, "Min Rate (bases/GPU/min)"),
    num(keys::MAX_RATE, "Max Rate (bases/GPU/min)"),
    num(keys::AVG_RATE, "Avg Rate (bases/GPU/min)"),
    num(keys::MONITOR_TIME, "Monitor Time (sec)"),
    num(keys::MEAN_INSERT_SIZE, "Mean Insert Size"),
    num(keys::GC_BIAS, "GC Bias"),
    num(keys::MEAN_QUALITY, "Mean Quality Score"),
];

fn column_by_key(key: &str) -> Option<&'static MetricColumn> {
    METRIC_COLUMNS.iter().find(|c| c.key == key)
}

fn column_by_header(header: &str) -> Option<&'static MetricColumn> {
    METRIC_COLUMNS.iter().find(|c| c.header == header)
}

/// Header text for a metric key; unknown keys are their own header.
pub fn header_for(key: &str) -> String {
    column_by_key(key).map(|c| c.header.to_string()).unwrap_or_else(|| key.to_string())
}

/// Inverse of `header_for`.
pub fn key_for(header: &str) -> String {
    column_by_header(header).map(|c| c.key.to_string()).unwrap_or_else(|| header.to_string())
}


#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    NotAvailable,
}

impl MetricValue {
    pub fn is_available(&self) -> bool {
        !matches!(self, MetricValue::NotAvailable)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Parses one CSV field. The NA token is always `NotAvailable`; numeric
    /// columns fall back to text rather than dropping a value they can't parse.
    pub fn from_field(field: &str, kind: ColumnKind) -> Self {
        let field = field.trim();
        if field.is_empty() || field == NA_TOKEN {
            return MetricValue::NotAvailable;
        }
        match kind {
            ColumnKind::Text => MetricValue::Text(field.to_string()),
            ColumnKind::Numeric => match field.parse::<f64>() {
                Ok(v) => MetricValue::Number(v),
                Err(_) => MetricValue::Text(field.to_string()),
            },
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "{}", s),
            MetricValue::NotAvailable => write!(f, "{}", NA_TOKEN),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<Option<f64>> for MetricValue {
    fn from(v: Option<f64>) -> Self {
        v.map(MetricValue::Number).unwrap_or(MetricValue::NotAvailable)
    }
}


/// Sparse metrics for one sample.
///
/// The set of available keys only grows: writing `NotAvailable` over an
/// available value is a no-op. Available values may replace each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRecord {
    values: BTreeMap<String, MetricValue>,
}

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_sample(sample_id: &str) -> Self {
        let mut record = Self::new();
        record.set(keys::SAMPLE, MetricValue::Text(sample_id.to_string()));
        record
    }

    /// Returns false when the write was dropped to protect an existing value.
    pub fn set(&mut self, key: &str, value: MetricValue) -> bool {
        if !value.is_available() && self.is_present(key) {
            return false;
        }
        self.values.insert(key.to_string(), value);
        true
    }

    pub fn set_number(&mut self, key: &str, value: f64) {
        self.set(key, MetricValue::Number(value));
    }

    pub fn set_opt(&mut self, key: &str, value: Option<f64>) {
        self.set(key, value.into());
    }

    pub fn merge(&mut self, other: MetricsRecord) {
        for (key, value) in other.values {
            self.set(&key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.values.get(key).filter(|v| v.is_available())
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MetricValue::as_f64)
    }

    pub fn is_present(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys holding an available value.
    pub fn present_keys(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_available())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present_keys().is_empty()
    }

    /// Every known column in file order, then any extra keys in key order.
    fn column_keys(&self) -> Vec<String> {
        let mut cols: Vec<String> = METRIC_COLUMNS.iter().map(|c| c.key.to_string()).collect();
        for key in self.values.keys() {
            if column_by_key(key).is_none() {
                cols.push(key.clone());
            }
        }
        cols
    }

    pub fn header(&self) -> Vec<String> {
        self.column_keys().iter().map(|k| header_for(k)).collect()
    }

    pub fn row(&self) -> Vec<String> {
        self.column_keys()
            .iter()
            .map(|k| self.values.get(k).cloned().unwrap_or(MetricValue::NotAvailable).to_string())
            .collect()
    }

    /// Rebuilds a record from a header row and one value row.
    pub fn from_row(header: &[String], row: &[String]) -> Self {
        let mut record = Self::new();
        for (i, head) in header.iter().enumerate() {
            let kind = column_by_header(head).map(|c| c.kind).unwrap_or(ColumnKind::Numeric);
            let key = key_for(head);
            let value = match row.get(i).map(|f| f.trim()) {
                // A sample literally named NA is still an identity, not a gap.
                Some(id) if key == keys::SAMPLE && !id.is_empty() => MetricValue::Text(id.to_string()),
                Some(field) => MetricValue::from_field(field, kind),
                None => MetricValue::NotAvailable,
            };
            record.set(&key, value);
        }
        record
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
        writer.write_record(self.header())?;
        writer.write_record(self.row())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let row: Vec<String> = match reader.records().next() {
            Some(record) => record?.iter().map(str::to_string).collect(),
            None => return Err(anyhow!("No data row in {}", path.display())),
        };
        Ok(Self::from_row(&header, &row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_present_key_never_reverts_to_na() {
        let mut record = MetricsRecord::for_sample("S1");
        record.set_number(keys::BWA_TIME, 12.5);
        assert!(!record.set(keys::BWA_TIME, MetricValue::NotAvailable));
        record.set_opt(keys::BWA_TIME, None);
        assert_eq!(record.number(keys::BWA_TIME), Some(12.5));

        let mut later = MetricsRecord::new();
        later.set(keys::BWA_TIME, MetricValue::NotAvailable);
        later.set_number(keys::SORTING_TIME, 3.0);
        record.merge(later);
        assert_eq!(record.number(keys::BWA_TIME), Some(12.5));
        assert_eq!(record.number(keys::SORTING_TIME), Some(3.0));
    }

    #[test]
    fn test_available_value_can_be_updated() {
        let mut record = MetricsRecord::new();
        record.set_number(keys::REGIONS_PROCESSED, 1000.0);
        record.set_number(keys::REGIONS_PROCESSED, 2500.0);
        assert_eq!(record.number(keys::REGIONS_PROCESSED), Some(2500.0));
    }

    #[test]
    fn test_na_placeholder_is_not_present() {
        let mut record = MetricsRecord::new();
        record.set(keys::GC_BIAS, MetricValue::NotAvailable);
        assert!(!record.is_present(keys::GC_BIAS));
        assert!(record.is_empty());
        record.set_number(keys::GC_BIAS, 0.98);
        assert!(record.is_present(keys::GC_BIAS));
    }

    #[test]
    fn test_row_uses_na_for_absent_columns() {
        let mut record = MetricsRecord::for_sample("S1");
        record.set_number(keys::ALIGNMENT_RATE, 90.0);
        let header = record.header();
        let row = record.row();
        assert_eq!(header.len(), METRIC_COLUMNS.len());
        assert_eq!(header[0], "Sample");
        assert_eq!(row[0], "S1");
        let rate_idx = header.iter().position(|h| h == "Alignment Rate (%)").unwrap();
        assert_eq!(row[rate_idx], "90");
        let gc_idx = header.iter().position(|h| h == "GC Bias").unwrap();
        assert_eq!(row[gc_idx], NA_TOKEN);
    }

    #[test]
    fn test_csv_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("S7_metrics.csv");

        let mut record = MetricsRecord::for_sample("S7");
        record.set_number(keys::READS_PROCESSED, 1234.0);
        record.set_number(keys::ALIGNMENT_RATE, 97.25);
        record.set_number(keys::MIN_RATE, 1.2);
        record.set(keys::MONITOR_DEVICE, MetricValue::Text("gpu".to_string()));
        record.set_number("custom_counter", 7.0);
        record.write_csv(&path)?;

        let back = MetricsRecord::read_csv(&path)?;
        for key in record.present_keys() {
            assert_eq!(back.get(key), record.get(key), "mismatch for {}", key);
        }
        assert!(!back.is_present(keys::GC_BIAS));
        Ok(())
    }

    #[test]
    fn test_sample_named_na_round_trips() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("NA_metrics.csv");
        let mut record = MetricsRecord::for_sample(NA_TOKEN);
        record.set_number(keys::READS_PROCESSED, 10.0);
        record.write_csv(&path)?;

        let back = MetricsRecord::read_csv(&path)?;
        assert_eq!(back.get(keys::SAMPLE), Some(&MetricValue::Text(NA_TOKEN.to_string())));
        assert_eq!(back.number(keys::READS_PROCESSED), Some(10.0));
        assert!(!back.is_present(keys::GC_BIAS));
        Ok(())
    }

    #[test]
    fn test_numeric_looking_sample_id_stays_text() {
        let header = vec!["Sample".to_string(), "Reads Processed".to_string()];
        let row = vec!["0012".to_string(), "NA".to_string()];
        let record = MetricsRecord::from_row(&header, &row);
        assert_eq!(record.get(keys::SAMPLE), Some(&MetricValue::Text("0012".to_string())));
        assert!(!record.is_present(keys::READS_PROCESSED));
    }
}
