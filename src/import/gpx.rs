use chrono::DateTime;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

use crate::error::ImportError;
use crate::import::csv::DEFAULT_ACCURACY_METERS;
use crate::import::{has_extension, TrackImporter};
use crate::models::LocationSample;

const FORMAT: &str = "GPX";

/// Meters of horizontal error per unit of HDOP
const HDOP_TO_METERS: f64 = 5.0;

/// GPX importer for recorded tracks
///
/// Reads every track point of every segment. Points without a timestamp are
/// skipped since they cannot be replayed.
pub struct GpxTrackImporter;

impl Default for GpxTrackImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl GpxTrackImporter {
    pub fn new() -> Self {
        Self
    }

    fn parse_error(reason: impl std::fmt::Display) -> ImportError {
        ImportError::Parse {
            format: FORMAT.to_string(),
            reason: reason.to_string(),
        }
    }

    fn convert(point: &gpx::Waypoint) -> Result<Option<LocationSample>, ImportError> {
        let Some(time) = &point.time else {
            return Ok(None);
        };
        let formatted = time.format().map_err(Self::parse_error)?;
        let timestamp = DateTime::parse_from_rfc3339(&formatted)
            .map_err(Self::parse_error)?
            .timestamp_millis();

        let position = point.point();
        let accuracy = point
            .hdop
            .map(|hdop| hdop * HDOP_TO_METERS)
            .unwrap_or(DEFAULT_ACCURACY_METERS);

        Ok(Some(LocationSample {
            latitude: position.y(),
            longitude: position.x(),
            altitude: point.elevation,
            accuracy,
            speed: None,
            bearing: None,
            timestamp,
        }))
    }
}

impl TrackImporter for GpxTrackImporter {
    fn can_import(&self, file_path: &Path) -> bool {
        has_extension(file_path, "gpx")
    }

    fn import_file(&self, file_path: &Path) -> Result<Vec<LocationSample>, ImportError> {
        let file = File::open(file_path).map_err(Self::parse_error)?;
        let document = gpx::read(BufReader::new(file)).map_err(Self::parse_error)?;

        let mut samples = Vec::new();
        let mut untimed = 0usize;
        for point in document
            .tracks
            .iter()
            .flat_map(|track| track.segments.iter())
            .flat_map(|segment| segment.points.iter())
        {
            match Self::convert(point)? {
                Some(sample) => samples.push(sample),
                None => untimed += 1,
            }
        }

        if untimed > 0 {
            debug!(untimed, "Skipped GPX points without time");
        }
        Ok(samples)
    }

    fn format_name(&self) -> &'static str {
        FORMAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TRACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="runcoach-tests" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>Morning run</name>
    <trkseg>
      <trkpt lat="52.5200" lon="13.4050">
        <ele>34.0</ele>
        <time>2024-05-01T07:00:00Z</time>
        <hdop>0.8</hdop>
      </trkpt>
      <trkpt lat="52.5201" lon="13.4050">
        <ele>35.0</ele>
        <time>2024-05-01T07:00:01Z</time>
      </trkpt>
      <trkpt lat="52.5202" lon="13.4050">
        <ele>35.5</ele>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_reads_timed_track_points() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.gpx");
        fs::write(&path, TRACK).unwrap();

        let samples = GpxTrackImporter::new().import_file(&path).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0].latitude - 52.52).abs() < 1e-9);
        assert!((samples[0].longitude - 13.405).abs() < 1e-9);
        assert_eq!(samples[0].altitude, Some(34.0));
        assert!((samples[0].accuracy - 4.0).abs() < 1e-9);
        assert_eq!(samples[1].accuracy, DEFAULT_ACCURACY_METERS);
        assert_eq!(samples[1].timestamp - samples[0].timestamp, 1_000);
    }

    #[test]
    fn test_malformed_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.gpx");
        fs::write(&path, "<gpx><trk>").unwrap();

        let err = GpxTrackImporter::new().import_file(&path).unwrap_err();
        assert!(matches!(err, ImportError::Parse { .. }));
    }
}
