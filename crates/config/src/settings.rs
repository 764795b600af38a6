// Document runtime settings
// Loaded from ~/.config/sheetfield/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sheets per row of the orphan scratch region.
pub const SCRATCH_WIDTH: i32 = 32;

/// Largest grid coordinate on either axis, matching the engine's clamp.
const GRID_EXTENT: i32 = 1_000_000;

/// Serializer used for newly written blobs. Both are always readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEncoding {
    /// Self-describing JSON (default)
    #[default]
    Json,
    /// Compact binary schema
    Compact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    // Paging
    #[serde(rename = "paging.marginPx")]
    pub margin_px: f64,

    #[serde(rename = "paging.maxMargin")]
    pub max_margin: i32,

    #[serde(rename = "paging.materializeMinScale")]
    pub materialize_min_scale: f64,

    #[serde(rename = "paging.maxResident")]
    pub max_resident: usize,

    // Previews
    #[serde(rename = "preview.devicePixelRatio")]
    pub device_pixel_ratio: f64,

    // Autosave
    #[serde(rename = "autosave.quietMs")]
    pub autosave_quiet_ms: u64,

    // Background workers
    #[serde(rename = "workers.count")]
    pub worker_count: usize,

    #[serde(rename = "workers.resultCapacity")]
    pub result_capacity: usize,

    // History
    #[serde(rename = "history.residentGroups")]
    pub resident_groups: usize,

    // Storage
    #[serde(rename = "storage.encoding")]
    pub encoding: StorageEncoding,

    // Orphan repair
    #[serde(rename = "repair.scratchOrigin")]
    pub scratch_origin: (i32, i32),
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            margin_px: 512.0,
            max_margin: 2,
            materialize_min_scale: 96.0,
            max_resident: 64,
            device_pixel_ratio: 1.0,
            autosave_quiet_ms: 2000,
            worker_count: 2,
            result_capacity: 256,
            resident_groups: 64,
            encoding: StorageEncoding::Json,
            scratch_origin: (-1_000_000, -1_000_000),
        }
    }
}

impl DocumentSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sheetfield");
        config_dir.join("settings.json")
    }

    /// Load settings from the user config directory, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from `path`. A missing or unparsable file yields
    /// defaults; settings problems never block opening a document.
    pub fn load_from(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("Error reading {}: {}", path.display(), e);
                return Self::default();
            }
        };

        // Strip comments (lines starting with //)
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        match serde_json::from_str::<Self>(&cleaned) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                log::warn!("Error parsing {}: {}; using default settings", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save current settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, json).map_err(|e| e.to_string())
    }

    /// Clamp values that would stall the runtime: zero workers, a
    /// zero-capacity channel, non-positive scales, or a scratch origin whose
    /// first row runs off the grid.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.worker_count = self.worker_count.max(1);
        self.result_capacity = self.result_capacity.max(1);
        self.max_margin = self.max_margin.max(0);
        self.resident_groups = self.resident_groups.max(1);
        if self.device_pixel_ratio.is_nan() || self.device_pixel_ratio <= 0.0 {
            self.device_pixel_ratio = defaults.device_pixel_ratio;
        }
        if self.margin_px.is_nan() || self.margin_px < 0.0 {
            self.margin_px = defaults.margin_px;
        }
        let (x, y) = self.scratch_origin;
        self.scratch_origin = (
            x.clamp(-GRID_EXTENT, GRID_EXTENT - (SCRATCH_WIDTH - 1)),
            y.clamp(-GRID_EXTENT, GRID_EXTENT),
        );
        self
    }

    pub fn autosave_quiet(&self) -> Duration {
        Duration::from_millis(self.autosave_quiet_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = DocumentSettings::load_from(&dir.path().join("nope.json"));
        assert_eq!(settings, DocumentSettings::default());
    }

    #[test]
    fn test_partial_file_with_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
    // keep everything resident
    "paging.maxResident": 8,
    "storage.encoding": "compact",
    "repair.scratchOrigin": [5, -5]
}"#,
        )
        .unwrap();

        let settings = DocumentSettings::load_from(&path);
        assert_eq!(settings.max_resident, 8);
        assert_eq!(settings.encoding, StorageEncoding::Compact);
        assert_eq!(settings.scratch_origin, (5, -5));
        assert_eq!(settings.autosave_quiet_ms, 2000);
    }

    #[test]
    fn test_scratch_origin_pulled_inside_grid() {
        let settings = DocumentSettings { scratch_origin: (1_000_000, 2_000_000), ..Default::default() }.sanitized();
        assert_eq!(settings.scratch_origin, (1_000_000 - 31, 1_000_000));

        let settings = DocumentSettings { scratch_origin: (i32::MIN, -7), ..Default::default() }.sanitized();
        assert_eq!(settings.scratch_origin, (-1_000_000, -7));
        assert_eq!(DocumentSettings::default().sanitized(), DocumentSettings::default());
    }

    #[test]
    fn test_garbage_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(DocumentSettings::load_from(&path), DocumentSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = DocumentSettings { worker_count: 4, ..Default::default() };
        settings.save_to(&path).unwrap();
        assert_eq!(DocumentSettings::load_from(&path), settings);
    }

    #[test]
    fn test_sanitized_clamps_zeroes() {
        let settings = DocumentSettings { worker_count: 0, result_capacity: 0, ..Default::default() }.sanitized();
        assert_eq!(settings.worker_count, 1);
        assert_eq!(settings.result_capacity, 1);
    }
}
