use std::path::Path;
use tracing::info;

use crate::error::ImportError;
use crate::models::LocationSample;

pub mod csv;
pub mod gpx;
pub mod replay;

pub use replay::{ReplayProgress, ReplaySource};

/// Reads a recorded track file into location samples
pub trait TrackImporter {
    /// Check if this importer can handle the given file
    fn can_import(&self, file_path: &Path) -> bool;

    /// Read every sample in the file, in file order
    fn import_file(&self, file_path: &Path) -> Result<Vec<LocationSample>, ImportError>;

    fn format_name(&self) -> &'static str;
}

pub(crate) fn has_extension(file_path: &Path, wanted: &str) -> bool {
    file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Picks the importer for a file by extension
pub struct ImportManager {
    importers: Vec<Box<dyn TrackImporter>>,
}

impl Default for ImportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportManager {
    pub fn new() -> Self {
        let importers: Vec<Box<dyn TrackImporter>> = vec![
            Box::new(csv::CsvTrackImporter::new()),
            Box::new(gpx::GpxTrackImporter::new()),
        ];

        Self { importers }
    }

    /// Import a track and order it by timestamp
    pub fn import_file(&self, file_path: &Path) -> Result<Vec<LocationSample>, ImportError> {
        let importer = self
            .importers
            .iter()
            .find(|importer| importer.can_import(file_path))
            .ok_or_else(|| ImportError::UnsupportedFormat {
                format: file_path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("<none>")
                    .to_string(),
            })?;

        let mut samples = importer.import_file(file_path)?;
        if samples.is_empty() {
            return Err(ImportError::Empty {
                path: file_path.display().to_string(),
            });
        }

        samples.sort_by_key(|sample| sample.timestamp);
        info!(
            path = %file_path.display(),
            format = importer.format_name(),
            samples = samples.len(),
            "Imported track"
        );
        Ok(samples)
    }

    pub fn supported_formats(&self) -> Vec<&'static str> {
        self.importers.iter().map(|i| i.format_name()).collect()
    }
}
