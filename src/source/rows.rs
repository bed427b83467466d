use std::collections::VecDeque;
use std::io::Read;

use serde::Serialize;
use tracing::warn;

const MAX_RECORDED_ISSUES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIssue {
    pub line: u64,
    pub message: String,
}

/// Lazy sequence of data rows whose arity matches the header.
///
/// Rows with a different cell count, or that fail to decode, are counted and
/// skipped. The stream is single-pass: re-reading requires opening the source
/// again.
pub struct RowStream {
    records: csv::StringRecordsIntoIter<Box<dyn Read>>,
    buffered: VecDeque<Vec<String>>,
    width: usize,
    limit: Option<usize>,
    accepted: usize,
    parse_errors: u64,
    issues: Vec<RowIssue>,
    exhausted: bool,
}

impl RowStream {
    pub(super) fn new(
        records: csv::StringRecordsIntoIter<Box<dyn Read>>,
        width: usize,
        limit: Option<usize>,
    ) -> Self {
        Self {
            records,
            buffered: VecDeque::new(),
            width,
            limit,
            accepted: 0,
            parse_errors: 0,
            issues: Vec::new(),
            exhausted: false,
        }
    }

    /// Reads up to `count` rows ahead and returns copies of them; the rows are
    /// still yielded by the iterator afterwards.
    pub(super) fn prefetch(&mut self, count: usize) -> Vec<Vec<String>> {
        let mut sample = Vec::with_capacity(count.min(64));
        while sample.len() < count {
            match self.read_valid() {
                Some(row) => {
                    sample.push(row.clone());
                    self.buffered.push_back(row);
                }
                None => break,
            }
        }
        sample
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    pub fn issues(&self) -> &[RowIssue] {
        &self.issues
    }

    fn read_valid(&mut self) -> Option<Vec<String>> {
        if self.exhausted {
            return None;
        }
        if self.limit.is_some_and(|limit| self.accepted >= limit) {
            self.exhausted = true;
            return None;
        }

        loop {
            let record = match self.records.next() {
                Some(Ok(record)) => record,
                Some(Err(err)) if err.is_io_error() => {
                    warn!(error = %err, "source stream ended with an I/O error");
                    self.record_issue(0, format!("read failed: {err}"));
                    self.exhausted = true;
                    return None;
                }
                Some(Err(err)) => {
                    let line = err.position().map(|pos| pos.line()).unwrap_or(0);
                    self.record_issue(line, err.to_string());
                    continue;
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            };

            if record.len() != self.width {
                let line = record.position().map(|pos| pos.line()).unwrap_or(0);
                self.record_issue(
                    line,
                    format!("expected {} cells, found {}", self.width, record.len()),
                );
                continue;
            }

            self.accepted += 1;
            return Some(record.iter().map(ToOwned::to_owned).collect());
        }
    }

    fn record_issue(&mut self, line: u64, message: String) {
        self.parse_errors += 1;
        warn!(line, message = %message, "skipping malformed row");
        if self.issues.len() < MAX_RECORDED_ISSUES {
            self.issues.push(RowIssue { line, message });
        }
    }
}

impl Iterator for RowStream {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffered.pop_front() {
            return Some(row);
        }
        self.read_valid()
    }
}
