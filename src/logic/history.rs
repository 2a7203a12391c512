//! Rolling sample history and running data logs for polling logic modules.

use crate::data::storage::TsvWriter;
use crate::error::AppResult;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Fixed-length history of several channels, oldest sample first.
///
/// Starts filled with zeros; every push drops the oldest column.
#[derive(Debug, Clone)]
pub struct History {
    channels: Vec<VecDeque<f64>>,
    capacity: usize,
}

impl History {
    /// `channels` rows of `capacity` zeros.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: (0..channels)
                .map(|_| std::iter::repeat(0.0).take(capacity).collect())
                .collect(),
            capacity,
        }
    }

    /// Append one sample per channel; extra values are ignored.
    pub fn push(&mut self, sample: &[f64]) {
        if self.capacity == 0 {
            return;
        }
        for (row, value) in self.channels.iter_mut().zip(sample) {
            row.pop_front();
            row.push_back(*value);
        }
    }

    /// Newest value of `channel` (0 when out of range).
    pub fn last(&self, channel: usize) -> f64 {
        self.channels
            .get(channel)
            .and_then(|row| row.back().copied())
            .unwrap_or(0.0)
    }

    /// Copy of one channel.
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        self.channels
            .get(channel)
            .map(|row| row.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Samples per channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the length; the history restarts from zeros.
    pub fn resize(&mut self, capacity: usize) {
        *self = Self::new(self.channels.len(), capacity);
    }
}

/// Column format for a [`DataLog`] row.
#[derive(Debug, Clone, Copy)]
pub struct Precision(pub usize);

/// A measurement file that grows one row per poll.
///
/// The first column is the time in seconds since the log was started.
pub struct DataLog {
    writer: TsvWriter,
    started: Instant,
}

impl DataLog {
    /// Create `dir/<timestamp>_<tag>_<name>.dat` with a `time (s)` column
    /// followed by `columns`.
    pub fn start(dir: &Path, tag: &str, name: &str, columns: &[String]) -> AppResult<Self> {
        let mut header = vec!["time (s)"];
        header.extend(columns.iter().map(String::as_str));
        let writer = TsvWriter::create(dir, tag, name, &[], &header)?;
        Ok(Self {
            writer,
            started: Instant::now(),
        })
    }

    /// Seconds since `start`.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Append `values` after the elapsed time, formatted `%.<p>E` each.
    ///
    /// `precisions[0]` applies to the time column.
    pub fn append(&mut self, values: &[f64], precisions: &[Precision]) -> AppResult<()> {
        let time = std::iter::once(self.elapsed());
        let fields: Vec<String> = time
            .chain(values.iter().copied())
            .enumerate()
            .map(|(i, v)| {
                let Precision(p) = precisions.get(i).copied().unwrap_or(Precision(6));
                crate::data::storage::format_sci(v, p)
            })
            .collect();
        self.writer.write_row(&fields)?;
        self.writer.flush()
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Close the file.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_rolls_left() {
        let mut history = History::new(3, 4);
        assert_eq!(history.channel(0), vec![0.0; 4]);

        history.push(&[1.0, 10.0, 100.0]);
        history.push(&[2.0, 20.0, 200.0]);
        assert_eq!(history.channel(0), vec![0.0, 0.0, 1.0, 2.0]);
        assert_eq!(history.last(2), 200.0);
        assert_eq!(history.last(7), 0.0);

        history.resize(2);
        assert_eq!(history.channel(1), vec![0.0, 0.0]);
        assert_eq!(history.capacity(), 2);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test(start_paused = true)]
    async fn data_log_prefixes_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DataLog::start(dir.path(), "", "probe_log", &["value (K)".to_string()]).unwrap();
        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        log.append(&[4.2], &[Precision(3), Precision(6)]).unwrap();
        let path = log.finish().unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# time (s)\tvalue (K)");
        assert_eq!(lines[1], "1.500E+00\t4.200000E+00");
    }
}
