//! # Motion event log
//!
//! Every detected region is appended as a CSV row, and a snapshot of the frame is stored next to
//! the log under the event's identifier.

use crate::detection::Detection;
use crate::error::{ClipError, Result};
use crate::frame::Frame;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Stores a frame as a still image.
pub trait SnapshotWriter: Send {
    /// File extension of the produced images, without the leading dot.
    fn extension(&self) -> &str;

    fn write_snapshot(&mut self, path: &Path, frame: &Frame) -> anyhow::Result<()>;
}

/// Writes snapshots as binary PPM images.
#[derive(Default)]
pub struct PpmSnapshotWriter;

impl SnapshotWriter for PpmSnapshotWriter {
    fn extension(&self) -> &str {
        "ppm"
    }

    fn write_snapshot(&mut self, path: &Path, frame: &Frame) -> anyhow::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "P6\n{} {}\n255\n", frame.width(), frame.height())?;
        for px in frame.pixels() {
            out.write_all(&[px.r, px.g, px.b])?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Identifier of an event logged at `timestamp`.
pub fn event_id(timestamp: &DateTime<Local>) -> String {
    format!("EV_{}", timestamp.format("%Y-%m-%d_%H%M%S"))
}

fn log_err(e: impl std::fmt::Display) -> ClipError {
    ClipError::EventLog(e.to_string())
}

/// CSV motion event log.
pub struct EventLogger {
    dir: PathBuf,
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl EventLogger {
    /// Create a new log file in `dir`, creating the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(log_err)?;

        let path = dir.join(format!(
            "motion_events_{}.csv",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let mut writer = csv::Writer::from_path(&path).map_err(log_err)?;
        writer
            .write_record(["Timestamp", "Event", "Contour_Area", "Position"])
            .map_err(log_err)?;
        writer.flush().map_err(log_err)?;

        log::debug!("Logging motion events to {:?}", path);

        Ok(Self { dir, path, writer })
    }

    /// Path of the CSV file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the CSV file and snapshots.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log a single detection and store a snapshot of `frame`.
    ///
    /// Returns the event identifier.
    ///
    /// # Arguments
    ///
    /// * `timestamp` - time of the detection.
    /// * `detection` - detected region.
    /// * `frame` - frame the region was found in.
    /// * `snapshots` - image writer used for the snapshot.
    pub fn log(
        &mut self,
        timestamp: &DateTime<Local>,
        detection: &Detection,
        frame: &Frame,
        snapshots: &mut dyn SnapshotWriter,
    ) -> Result<String> {
        let id = event_id(timestamp);
        let (cx, cy) = detection.centroid;

        self.writer
            .write_record([
                timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                id.clone(),
                detection.area.to_string(),
                format!("({cx}, {cy})"),
            ])
            .map_err(log_err)?;
        self.writer.flush().map_err(log_err)?;

        let snapshot = self.dir.join(format!("{id}.{}", snapshots.extension()));
        snapshots.write_snapshot(&snapshot, frame).map_err(log_err)?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RGBA;
    use chrono::TimeZone;

    #[test]
    fn logs_rows_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let mut logger = EventLogger::create(&log_dir).unwrap();
        assert_eq!(logger.dir(), log_dir);

        let ts = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let frame = Frame::filled(2, 1, RGBA::opaque(1, 2, 3));
        let detection = Detection::from_bounds(1200, (10, 20, 30, 40));

        let id = logger
            .log(&ts, &detection, &frame, &mut PpmSnapshotWriter)
            .unwrap();
        assert_eq!(id, "EV_2024-03-09_070501");

        let csv = std::fs::read_to_string(logger.path()).unwrap();
        assert_eq!(
            csv,
            "Timestamp,Event,Contour_Area,Position\n\
             2024-03-09 07:05:01,EV_2024-03-09_070501,1200,\"(25, 40)\"\n"
        );

        let snapshot = std::fs::read(log_dir.join("EV_2024-03-09_070501.ppm")).unwrap();
        assert_eq!(snapshot, b"P6\n2 1\n255\n\x01\x02\x03\x01\x02\x03");
    }
}
