use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ImportError;
use crate::import::{has_extension, TrackImporter};
use crate::models::LocationSample;

/// Accuracy assumed when a track carries none, in meters
pub const DEFAULT_ACCURACY_METERS: f64 = 5.0;

const FORMAT: &str = "CSV";

/// CSV track importer with flexible column names
///
/// Requires timestamp, latitude and longitude columns. Integer timestamps are
/// epoch milliseconds; text timestamps go through the usual date formats.
pub struct CsvTrackImporter {
    column_mapping: HashMap<String, &'static str>,
}

impl Default for CsvTrackImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvTrackImporter {
    pub fn new() -> Self {
        let mut column_mapping = HashMap::new();

        Self::add_mapping(
            &mut column_mapping,
            "timestamp",
            &["timestamp", "timestamp_ms", "time", "date_time"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "latitude",
            &["latitude", "lat", "position_lat"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "longitude",
            &["longitude", "lon", "lng", "position_long"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "altitude",
            &["altitude", "elevation", "alt", "ele"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "accuracy",
            &["accuracy", "horizontal_accuracy", "hacc"],
        );
        Self::add_mapping(&mut column_mapping, "speed", &["speed", "speed_ms"]);
        Self::add_mapping(&mut column_mapping, "bearing", &["bearing", "heading", "course"]);

        Self { column_mapping }
    }

    fn add_mapping(
        mapping: &mut HashMap<String, &'static str>,
        standard: &'static str,
        variations: &[&str],
    ) {
        for variation in variations {
            mapping.insert(variation.to_lowercase(), standard);
        }
    }

    fn normalize_column_name(&self, name: &str) -> Option<&'static str> {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        self.column_mapping.get(&normalized).copied()
    }

    fn parse_timestamp(raw: &str) -> Option<i64> {
        if let Ok(ms) = raw.parse::<i64>() {
            return Some(ms);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp_millis());
        }

        let formats = [
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
        ];
        formats.iter().find_map(|format| {
            NaiveDateTime::parse_from_str(raw, format)
                .ok()
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp_millis())
        })
    }

    fn parse_error(line: u64, reason: impl std::fmt::Display) -> ImportError {
        ImportError::Parse {
            format: FORMAT.to_string(),
            reason: format!("line {}: {}", line, reason),
        }
    }

    fn parse_record(
        columns: &HashMap<&'static str, usize>,
        record: &StringRecord,
        line: u64,
    ) -> Result<LocationSample, ImportError> {
        let field = |name: &str| {
            columns
                .get(name)
                .and_then(|&index| record.get(index))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let number = |name: &str| -> Result<Option<f64>, ImportError> {
            field(name)
                .map(|value| {
                    value
                        .parse::<f64>()
                        .map_err(|e| Self::parse_error(line, format!("{}: {}", name, e)))
                })
                .transpose()
        };

        let timestamp = field("timestamp")
            .and_then(Self::parse_timestamp)
            .ok_or_else(|| Self::parse_error(line, "missing or unreadable timestamp"))?;
        let latitude =
            number("latitude")?.ok_or_else(|| Self::parse_error(line, "missing latitude"))?;
        let longitude =
            number("longitude")?.ok_or_else(|| Self::parse_error(line, "missing longitude"))?;
        let accuracy = number("accuracy")?.unwrap_or(DEFAULT_ACCURACY_METERS);

        Ok(LocationSample {
            latitude,
            longitude,
            altitude: number("altitude")?,
            accuracy,
            speed: number("speed")?,
            bearing: number("bearing")?,
            timestamp,
        })
    }
}

impl TrackImporter for CsvTrackImporter {
    fn can_import(&self, file_path: &Path) -> bool {
        has_extension(file_path, "csv")
    }

    fn import_file(&self, file_path: &Path) -> Result<Vec<LocationSample>, ImportError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(file_path)
            .map_err(|e| Self::parse_error(0, e))?;

        let headers = reader.headers().map_err(|e| Self::parse_error(1, e))?.clone();
        let columns: HashMap<&'static str, usize> = headers
            .iter()
            .enumerate()
            .filter_map(|(index, name)| self.normalize_column_name(name).map(|n| (n, index)))
            .collect();

        for required in ["timestamp", "latitude", "longitude"] {
            if !columns.contains_key(required) {
                return Err(Self::parse_error(1, format!("no {} column", required)));
            }
        }

        let mut samples = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let line = row as u64 + 2;
            let record = result.map_err(|e| Self::parse_error(line, e))?;
            samples.push(Self::parse_record(&columns, &record, line)?);
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

    fn import(contents: &str) -> Result<Vec<LocationSample>, ImportError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        fs::write(&path, contents).unwrap();
        CsvTrackImporter::new().import_file(&path)
    }

    #[test]
    fn test_aliases_and_optional_columns() {
        let samples = import(
            "Time,Latitude,Lng,Elevation,Accuracy,Speed\n\
             2024-05-01T07:00:00Z,52.52,13.40,34.5,4.0,2.9\n\
             2024-05-01 07:00:01,52.52001,13.40,,,\n",
        )
        .unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp, 1_714_546_800_000);
        assert_eq!(samples[1].timestamp, 1_714_546_801_000);
        assert_eq!(samples[0].altitude, Some(34.5));
        assert_eq!(samples[0].speed, Some(2.9));
        assert_eq!(samples[1].altitude, None);
        assert_eq!(samples[1].accuracy, DEFAULT_ACCURACY_METERS);
    }

    #[test]
    fn test_missing_required_column() {
        let err = import("timestamp,lat\n1000,52.0\n").unwrap_err();
        assert!(err.to_string().contains("longitude"));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let err = import("timestamp,lat,lon\n1000,52.0,13.0\n2000,north,13.0\n").unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }
}
