/// Tolerant metric extraction from Parabricks stage output.
///
/// Extraction is a table of independent rules. Each rule runs against the whole
/// text; a miss only leaves its own keys absent.
use std::collections::HashMap;
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use crate::utils::metrics::{keys, MetricsRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Alignment,
    VariantCalling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Occurrence {
    /// Single-shot values: timings, counts.
    First,
    /// Progress counters that are re-printed as the run advances.
    Last,
}

#[derive(Debug, Clone)]
pub enum RuleShape {
    Scalar { key: &'static str, occurrence: Occurrence },
    /// One capture group per key, in order.
    Block { keys: Vec<&'static str> },
}

#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub stage: StageKind,
    pub pattern: Regex,
    pub shape: RuleShape,
}

impl ExtractionRule {
    pub fn scalar(stage: StageKind, key: &'static str, pattern: &str, occurrence: Occurrence) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| anyhow!("Regex error for {}: {}", key, e))?;
        if pattern.captures_len() < 2 {
            return Err(anyhow!("Pattern for {} has no capture group", key));
        }
        Ok(ExtractionRule { stage, pattern, shape: RuleShape::Scalar { key, occurrence } })
    }

    pub fn block(stage: StageKind, keys: &[&'static str], pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| anyhow!("Regex error for {:?}: {}", keys, e))?;
        if pattern.captures_len() - 1 != keys.len() {
            return Err(anyhow!(
                "Block pattern has {} groups for {} keys",
                pattern.captures_len() - 1,
                keys.len()
            ));
        }
        Ok(ExtractionRule { stage, pattern, shape: RuleShape::Block { keys: keys.to_vec() } })
    }

    pub fn keys(&self) -> Vec<&'static str> {
        match &self.shape {
            RuleShape::Scalar { key, .. } => vec![*key],
            RuleShape::Block { keys } => keys.clone(),
        }
    }

    /// Block rules own their keys over any scalar rule for the same key.
    pub fn priority(&self) -> u8 {
        match self.shape {
            RuleShape::Scalar { .. } => 0,
            RuleShape::Block { .. } => 1,
        }
    }

    fn apply(&self, text: &str) -> Vec<(&'static str, f64)> {
        match &self.shape {
            RuleShape::Scalar { key, occurrence } => {
                let value = match occurrence {
                    Occurrence::First => self
                        .pattern
                        .captures(text)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse::<f64>().ok()),
                    Occurrence::Last => self
                        .pattern
                        .captures_iter(text)
                        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<f64>().ok()))
                        .last(),
                };
                value.map(|v| vec![(*key, v)]).unwrap_or_default()
            }
            RuleShape::Block { keys } => {
                let Some(caps) = self.pattern.captures(text) else {
                    return Vec::new();
                };
                let mut out = Vec::with_capacity(keys.len());
                for (i, key) in keys.iter().enumerate() {
                    match caps.get(i + 1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                        Some(v) => out.push((*key, v)),
                        None => return Vec::new(),
                    }
                }
                out
            }
        }
    }
}


lazy_static! {
    static ref DEFAULT_RULES: Vec<ExtractionRule> = {
        use Occurrence::{First, Last};
        use StageKind::{Alignment, VariantCalling};
        vec![
            ExtractionRule::scalar(Alignment, keys::BWA_TIME, r"bwalib run finished in ([\d.]+) seconds", First),
            ExtractionRule::scalar(Alignment, keys::SORTING_TIME, r"Sorting and Marking: ([\d.]+) seconds", First),
            ExtractionRule::scalar(Alignment, keys::BQSR_TIME, r"BQSR and writing final BAM:\s*([\d.]+) seconds", First),
            ExtractionRule::scalar(Alignment, keys::TIME_READING, r"Time spent reading:\s*([\d.]+)\s*seconds", First),
            ExtractionRule::scalar(Alignment, keys::MONITOR_TIME, r"Time spent monitoring.*?:\s*([\d.]+)", First),
            ExtractionRule::block(
                Alignment,
                &[keys::MIN_RATE, keys::MAX_RATE, keys::AVG_RATE],
                r"(?s)Rate stats.*?:\s*min rate:\s*([\d.]+).*?max rate:\s*([\d.]+).*?avg rate:\s*([\d.]+)",
            ),
            ExtractionRule::scalar(VariantCalling, keys::REGIONS_PROCESSED, r"Regions-Processed\s+\d+\s+\d+\s+(\d+)\s+\d+", Last),
            ExtractionRule::scalar(VariantCalling, keys::REGIONS_PER_MINUTE, r"Regions/Minute\s+(\d+)", Last),
        ]
        .into_iter()
        .collect::<Result<Vec<_>>>()
        .expect("default extraction rules compile")
    };
}


#[derive(Debug, Clone)]
pub struct MetricsExtractor {
    rules: Vec<ExtractionRule>,
}

impl Default for MetricsExtractor {
    fn default() -> Self {
        MetricsExtractor { rules: DEFAULT_RULES.clone() }
    }
}

impl MetricsExtractor {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        MetricsExtractor { rules }
    }

    pub fn rules(&self) -> &[ExtractionRule] {
        &self.rules
    }

    /// Applies every rule in the table.
    pub fn extract(&self, text: &str) -> MetricsRecord {
        self.run(self.rules.iter(), text)
    }

    /// Applies only the rules scoped to `stage`.
    pub fn extract_stage(&self, stage: StageKind, text: &str) -> MetricsRecord {
        self.run(self.rules.iter().filter(|r| r.stage == stage), text)
    }

    /// Key ownership is decided over the whole table, so a block in one stage
    /// still shadows a scalar for the same key in another.
    fn run<'a>(&self, rules: impl Iterator<Item = &'a ExtractionRule>, text: &str) -> MetricsRecord {
        let mut owner: HashMap<&'static str, u8> = HashMap::new();
        for rule in &self.rules {
            for key in rule.keys() {
                let p = owner.entry(key).or_insert(0);
                *p = (*p).max(rule.priority());
            }
        }

        let mut record = MetricsRecord::new();
        for rule in rules {
            let found = rule.apply(text);
            if found.is_empty() {
                debug!("No match for {:?}", rule.keys());
            }
            for (key, value) in found {
                if owner.get(key).copied().unwrap_or(0) > rule.priority() {
                    continue;
                }
                record.set_number(key, value);
            }
        }
        record
    }
}


#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlagstatCounts {
    pub total: Option<u64>,
    pub properly_paired: Option<u64>,
}

/// Reads the read totals out of `samtools flagstat` output.
pub fn parse_flagstat(text: &str) -> FlagstatCounts {
    let mut counts = FlagstatCounts::default();
    let first_int = |line: &str| line.split_whitespace().next().and_then(|t| t.parse::<u64>().ok());
    for line in text.lines() {
        if line.contains("in total") {
            if let Some(v) = first_int(line) {
                counts.total = Some(v);
            }
        }
        if line.contains("properly paired") {
            if let Some(v) = first_int(line) {
                counts.properly_paired = Some(v);
            }
        }
    }
    counts
}

/// Record count from `bcftools stats` output.
pub fn parse_variant_count(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (_, rest) = line.split_once("number of records:")?;
        rest.split_whitespace().next()?.parse::<u64>().ok()
    })
}

/// Properly-paired share of aligned reads, in percent. Zero aligned reads is a
/// computed zero, not a missing value.
pub fn alignment_rate(total: u64, properly_paired: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        properly_paired as f64 / total as f64 * 100.0
    }
}
