//! Classification of `zfs send -v -P` diagnostics.

use crate::Result;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendLine {
    /// Estimated stream size in bytes, announced once.
    TotalSize(u64),
    /// Bytes sent so far.
    Progress(u64),
    /// Known informational line.
    Header,
    /// Anything else; reported if the pipeline fails.
    Candidate(String),
}

pub struct ProgressParser {
    total: Regex,
    progress: Regex,
    header: Regex,
    total_bytes: Option<u64>,
    bytes_sent: u64,
    candidates: Vec<String>,
}

impl ProgressParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            total: Regex::new(r"^(?:size|total estimated size is)\s+(\d+)$")?,
            progress: Regex::new(r"^\d{2}:\d{2}:\d{2}\s+(\d+)\s+\S+$")?,
            header: Regex::new(
                r"^(?:(?:full|incremental)\s|TIME\s+SENT\s+SNAPSHOT|send from |(?:total )?estimated size is )",
            )?,
            total_bytes: None,
            bytes_sent: 0,
            candidates: Vec::new(),
        })
    }

    pub fn classify(&self, line: &str) -> SendLine {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return SendLine::Header;
        }
        if let Some(bytes) = capture_number(&self.total, line) {
            return SendLine::TotalSize(bytes);
        }
        if let Some(bytes) = capture_number(&self.progress, line) {
            return SendLine::Progress(bytes);
        }
        if self.header.is_match(line) {
            return SendLine::Header;
        }
        SendLine::Candidate(line.to_string())
    }

    /// Classify and fold into the running totals.
    pub fn feed(&mut self, line: &str) -> SendLine {
        let classified = self.classify(line);
        match &classified {
            SendLine::TotalSize(bytes) => {
                if self.total_bytes.is_none() {
                    self.total_bytes = Some(*bytes);
                }
            }
            SendLine::Progress(bytes) => self.bytes_sent = *bytes,
            SendLine::Header => {}
            SendLine::Candidate(line) => self.candidates.push(line.clone()),
        }
        classified
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whole percent, capped at 100; `None` until the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total_bytes {
            Some(0) => Some(100),
            Some(total) => Some((self.bytes_sent.saturating_mul(100) / total).min(100) as u8),
            None => None,
        }
    }

    /// Unrecognized lines, joined; the failure detail for a non-zero exit.
    pub fn failure_detail(&self) -> Option<String> {
        (!self.candidates.is_empty()).then(|| self.candidates.join("\n"))
    }
}

fn capture_number(pattern: &Regex, line: &str) -> Option<u64> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
