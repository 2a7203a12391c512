//! Tab-separated measurement files.
//!
//! Every file starts with a block of `#` comment lines: `key: value`
//! metadata, then the column names. Data rows follow, one per line.
//! File names carry the local creation time:
//! `YYYYMMDD-HHMM-SS_<tag>_<name>.dat`.
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name for a measurement started at `timestamp`.
///
/// An empty `tag` is left out together with its separator.
pub fn file_name(timestamp: DateTime<Local>, tag: &str, name: &str) -> String {
    let stamp = timestamp.format("%Y%m%d-%H%M-%S");
    if tag.is_empty() {
        format!("{}_{}.dat", stamp, name)
    } else {
        format!("{}_{}_{}.dat", stamp, tag, name)
    }
}

/// Scientific notation with a signed two-digit exponent, `1.234E+03`.
pub fn format_sci(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let raw = format!("{:.*e}", precision, value);
    match raw.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}E{}{:02}", mantissa, sign, exponent.abs())
        }
        None => raw,
    }
}

/// A writer for tab-separated `.dat` files.
#[cfg(feature = "storage_csv")]
pub struct TsvWriter {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

/// Placeholder when the `storage_csv` feature is off; `create` always fails.
#[cfg(not(feature = "storage_csv"))]
pub struct TsvWriter {
    path: PathBuf,
}

impl TsvWriter {
    /// Create `dir/<timestamp>_<tag>_<name>.dat` and write its header.
    pub fn create(
        dir: &Path,
        tag: &str,
        name: &str,
        metadata: &[(&str, String)],
        columns: &[&str],
    ) -> AppResult<Self> {
        let path = dir.join(file_name(Local::now(), tag, name));
        Self::create_at(path, metadata, columns)
    }

    /// Create the file at an explicit path.
    #[cfg(feature = "storage_csv")]
    pub fn create_at(path: PathBuf, metadata: &[(&str, String)], columns: &[&str]) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| DaqError::Storage(e.to_string()))?;
            }
        }
        let mut file = File::create(&path)
            .map_err(|e| DaqError::Storage(format!("Failed to create {}: {}", path.display(), e)))?;

        let mut header = String::new();
        for (key, value) in metadata {
            header.push_str(&format!("# {}: {}\n", key, value));
        }
        header.push_str("# ");
        header.push_str(&columns.join("\t"));
        header.push('\n');
        file.write_all(header.as_bytes())?;

        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        info!(path = %path.display(), "Data file created");
        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
        })
    }

    /// Create the file at an explicit path.
    #[cfg(not(feature = "storage_csv"))]
    pub fn create_at(path: PathBuf, _metadata: &[(&str, String)], _columns: &[&str]) -> AppResult<Self> {
        let _ = path;
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row of preformatted fields.
    #[cfg(feature = "storage_csv")]
    pub fn write_row<S: AsRef<str>>(&mut self, fields: &[S]) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage(format!("{} is closed", self.path.display())))?;
        writer.write_record(fields.iter().map(|f| f.as_ref()))?;
        self.rows += 1;
        Ok(())
    }

    /// Append one row of preformatted fields.
    #[cfg(not(feature = "storage_csv"))]
    pub fn write_row<S: AsRef<str>>(&mut self, _fields: &[S]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Append one row, every value as `%.6E`.
    pub fn write_values(&mut self, values: &[f64]) -> AppResult<()> {
        let fields: Vec<String> = values.iter().map(|v| format_sci(*v, 6)).collect();
        self.write_row(&fields)
    }

    /// Push buffered rows to disk.
    #[cfg(feature = "storage_csv")]
    pub fn flush(&mut self) -> AppResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Push buffered rows to disk.
    #[cfg(not(feature = "storage_csv"))]
    pub fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Flush and close; further writes fail.
    #[cfg(feature = "storage_csv")]
    pub fn finish(&mut self) -> AppResult<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(path = %self.path.display(), rows = self.rows, "Data file closed");
        }
        Ok(self.path.clone())
    }

    /// Flush and close; further writes fail.
    #[cfg(not(feature = "storage_csv"))]
    pub fn finish(&mut self) -> AppResult<PathBuf> {
        Ok(self.path.clone())
    }
}

/// Write a complete table in one go; returns the file path.
pub fn save_table(
    dir: &Path,
    tag: &str,
    name: &str,
    metadata: &[(&str, String)],
    columns: &[&str],
    rows: &[Vec<f64>],
) -> AppResult<PathBuf> {
    let mut writer = TsvWriter::create(dir, tag, name, metadata, columns)?;
    for row in rows {
        writer.write_values(row)?;
    }
    writer.finish()
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn file_names_carry_timestamp_and_tag() {
        let t = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(file_name(t, "sampleA", "Saturation_data"), "20240307-0905-02_sampleA_Saturation_data.dat");
        assert_eq!(file_name(t, "", "tip_temperature_log"), "20240307-0905-02_tip_temperature_log.dat");
    }

    #[test]
    fn sci_format_matches_printf() {
        assert_eq!(format_sci(1234.0, 3), "1.234E+03");
        assert_eq!(format_sci(0.000123, 6), "1.230000E-04");
        assert_eq!(format_sci(0.0, 3), "0.000E+00");
        assert_eq!(format_sci(-4.2, 3), "-4.200E+00");
    }

    #[test]
    fn header_then_rows() {
        let dir = tempdir().unwrap();
        let path = save_table(
            dir.path(),
            "run1",
            "Saturation_data",
            &[("Power unit", "W".to_string())],
            &["power (W)", "fluorescence (c/s)"],
            &[vec![0.001, 2000.0], vec![0.002, 3900.0]],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# Power unit: W");
        assert_eq!(lines[1], "# power (W)\tfluorescence (c/s)");
        assert_eq!(lines[2], "1.000000E-03\t2.000000E+03");
        assert_eq!(lines.len(), 4);
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_run1_Saturation_data.dat"));
    }

    #[test]
    fn closed_writer_rejects_rows() {
        let dir = tempdir().unwrap();
        let mut writer = TsvWriter::create_at(dir.path().join("nested/x.dat"), &[], &["a"]).unwrap();
        writer.write_row(&["1"]).unwrap();
        writer.finish().unwrap();
        assert!(writer.write_row(&["2"]).is_err());
    }
}
