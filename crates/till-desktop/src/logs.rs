use std::collections::VecDeque;

use till_service::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// One captured line of child output, tagged with the process run that
/// produced it. A change of `run_id` between neighbours marks a restart.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub run_id: RunId,
    pub stream: LogStream,
    pub text: String,
}

/// A page of captured output and the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LogTail {
    pub lines: Vec<LogLine>,
    pub cursor: u64,
}

impl LogTail {
    /// Indices into `lines` where a new process run begins.
    pub fn run_boundaries(&self) -> Vec<usize> {
        self.lines
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].run_id != pair[1].run_id)
            .map(|(i, _)| i + 1)
            .collect()
    }
}

/// Bounded output history of one service, across all of its runs.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    written: u64,
    entries: VecDeque<LogLine>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            written: 0,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, run_id: &RunId, stream: LogStream, text: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.written += 1;
        self.entries.push_back(LogLine {
            seq: self.written,
            run_id: run_id.clone(),
            stream,
            text,
        });
    }

    /// Up to `limit` lines with a sequence number above `cursor`, oldest
    /// first. Cursor 0 means "nothing seen yet" and yields the newest lines.
    pub fn tail(&self, cursor: u64, limit: usize) -> LogTail {
        let start = if cursor == 0 {
            self.entries.len().saturating_sub(limit)
        } else {
            self.entries.partition_point(|line| line.seq <= cursor)
        };
        let lines: Vec<LogLine> = self.entries.range(start..).take(limit).cloned().collect();
        let cursor = lines.last().map_or(cursor, |line| line.seq);
        LogTail { lines, cursor }
    }
}
