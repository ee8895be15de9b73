//! Export of simulation results.
//!
//! A `sim_done` payload is a list whose first element holds the trace labels and whose
//! remaining elements are rows of values. [`SimulationResult`] writes it as CSV with an
//! `index` column prepended. The overlay's [`RecordingBuffer`] is written alongside it with
//! a `t` column and one column per recorded site.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use serde_json::Value;
use tracing::info;

use crate::error::{ViewerError, ViewerResult};
use crate::overlay::RecordingBuffer;

/// Final traces of a simulation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationResult {
    /// Column labels (time first).
    pub labels: Vec<String>,
    /// Rows of values; `None` for missing samples.
    pub rows: Vec<Vec<Option<f64>>>,
}

impl TryFrom<Vec<Value>> for SimulationResult {
    type Error = ViewerError;

    fn try_from(payload: Vec<Value>) -> Result<Self, Self::Error> {
        let mut items = payload.into_iter();
        let labels = match items.next() {
            Some(Value::Array(labels)) => labels
                .into_iter()
                .map(|label| match label {
                    Value::String(s) => Ok(s),
                    other => Err(ViewerError::ProtocolViolation(format!(
                        "sim_done label is not a string: {other}"
                    ))),
                })
                .collect::<ViewerResult<Vec<_>>>()?,
            Some(other) => {
                return Err(ViewerError::ProtocolViolation(format!(
                    "sim_done labels are not a list: {other}"
                )))
            }
            None => return Err(ViewerError::ProtocolViolation("empty sim_done payload".into())),
        };

        let rows = items
            .enumerate()
            .map(|(i, row)| match row {
                Value::Array(values) => values
                    .into_iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Number(n) => Ok(n.as_f64()),
                        other => Err(ViewerError::ProtocolViolation(format!(
                            "sim_done row {i} holds a non-numeric value: {other}"
                        ))),
                    })
                    .collect(),
                other => Err(ViewerError::ProtocolViolation(format!(
                    "sim_done row {i} is not a list: {other}"
                ))),
            })
            .collect::<ViewerResult<Vec<_>>>()?;

        Ok(Self { labels, rows })
    }
}

impl SimulationResult {
    /// Writes `index,<labels>` followed by one `i,<row>` line per row.
    pub fn write_csv<W: Write>(&self, writer: W) -> ViewerResult<()> {
        let mut csv = csv::WriterBuilder::new().flexible(true).from_writer(writer);
        csv.write_record(std::iter::once("index").chain(self.labels.iter().map(String::as_str)))?;
        for (i, row) in self.rows.iter().enumerate() {
            csv.write_record(std::iter::once(i.to_string()).chain(row.iter().map(format_value)))?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Renders the CSV into a string.
    pub fn to_csv(&self) -> ViewerResult<String> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ViewerError::ProtocolViolation(e.to_string()))
    }

    /// Writes the CSV to a file.
    pub fn save(&self, path: &Path) -> ViewerResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(std::io::BufWriter::new(file))?;
        info!(path = %path.display(), rows = self.rows.len(), "Saved simulation result");
        Ok(())
    }
}

/// Writes the recording buffer as CSV with a `t` column followed by one column per site.
pub fn write_recordings<W: Write>(buffer: &RecordingBuffer, writer: W) -> ViewerResult<()> {
    let mut csv = csv::WriterBuilder::new().flexible(true).from_writer(writer);
    csv.write_record(std::iter::once("t").chain(buffer.sites().iter().map(String::as_str)))?;
    for row in buffer.rows() {
        csv.write_record(
            std::iter::once(row.time.to_string()).chain(row.values.iter().map(format_value)),
        )?;
    }
    csv.flush()?;
    Ok(())
}

/// Writes the recording buffer to a file.
pub fn save_recordings(buffer: &RecordingBuffer, path: &Path) -> ViewerResult<()> {
    let file = std::fs::File::create(path)?;
    write_recordings(buffer, std::io::BufWriter::new(file))?;
    info!(path = %path.display(), rows = buffer.len(), "Saved recordings");
    Ok(())
}

/// File the recordings go to when the result is saved at `path`: `sim.csv` becomes
/// `sim.recordings.csv`.
#[must_use]
pub fn recordings_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "sim".into(), |s| s.to_string_lossy().into_owned());
    path.with_file_name(format!("{stem}.recordings.csv"))
}

fn format_value(value: &Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Suggested download name for a result:
/// `sim_<model>_<YYYY-MM-DD>_<HH-MM-SS>_amp-<iclamp>-<amp>nA.csv`.
///
/// The model part is left out when the session loaded a URL; the clamp section is written
/// as `dend_3` for `dend[3]`.
#[must_use]
pub fn suggested_file_name<Tz: TimeZone>(
    model: Option<&str>,
    iclamp: Option<&str>,
    amp: f64,
    at: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let stamp = at.format("%Y-%m-%d_%H-%M-%S");
    let clamp = iclamp.map_or_else(|| "none".to_string(), iclamp_label);
    match model {
        Some(model) => format!("sim_{model}_{stamp}_amp-{clamp}-{amp}nA.csv"),
        None => format!("sim_{stamp}_amp-{clamp}-{amp}nA.csv"),
    }
}

/// Renders `dend[3]` as `dend_3`.
#[must_use]
pub fn iclamp_label(section: &str) -> String {
    section.replacen('[', "_", 1).replacen(']', "", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn result() -> SimulationResult {
        SimulationResult::try_from(vec![
            json!(["t", "soma[0]_0"]),
            json!([0.0, -73.0]),
            json!([0.025, null]),
        ])
        .unwrap()
    }

    #[test]
    fn csv_has_index_column() {
        let csv = result().to_csv().unwrap();
        assert_eq!(csv, "index,t,soma[0]_0\n0,0,-73\n1,0.025,\n");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(SimulationResult::try_from(Vec::<Value>::new()).is_err());
        assert!(SimulationResult::try_from(vec![json!("t")]).is_err());
        assert!(SimulationResult::try_from(vec![json!(["t"]), json!(["x"])]).is_err());
    }

    #[test]
    fn file_name_follows_convention() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            suggested_file_name(Some("model-42"), Some("dend[3]"), 0.7, &at),
            "sim_model-42_2024-03-05_07-08-09_amp-dend_3-0.7nA.csv"
        );
        assert_eq!(
            suggested_file_name(None, Some("soma[0]"), 1.0, &at),
            "sim_2024-03-05_07-08-09_amp-soma_0-1nA.csv"
        );
    }

    #[test]
    fn recordings_csv_has_time_column() {
        let mut out = Vec::new();
        write_recordings(&RecordingBuffer::default(), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "t\n");
    }

    #[test]
    fn recordings_sit_next_to_result() {
        assert_eq!(
            recordings_path(Path::new("/tmp/out/sim.csv")),
            PathBuf::from("/tmp/out/sim.recordings.csv")
        );
        assert_eq!(
            recordings_path(Path::new("traces")),
            PathBuf::from("traces.recordings.csv")
        );
    }

    #[test]
    fn save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.csv");
        result().save(&path).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("index,t,soma[0]_0\n"));
    }
}
