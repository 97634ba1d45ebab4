pub mod index;
pub mod test_objects;

use std::fmt::{self, Display};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay};

pub use index::{
    FileIndex,
    IndexEntry,
    MergeOutcome,
    ProductCodeRegistry,
    RetentionPolicy,
    UpdateFlags,
};

/// NEXRAD processing level of a source archive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, AsRefStr, StrumDisplay,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    #[strum(serialize = "2")]
    Level2,
    #[strum(serialize = "3")]
    Level3,
}

impl Level {
    /// Level 2 volumes hold several elevation sweeps; Level 3 products hold one.
    pub fn is_multi_sweep(&self) -> bool {
        matches!(self, Level::Level2)
    }

    pub fn artifact_prefix(&self) -> String {
        format!("plots_level{}/", self)
    }
}

impl TryFrom<u8> for Level {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            2 => Ok(Level::Level2),
            3 => Ok(Level::Level3),
            other => Err(anyhow!("unsupported radar level: {}", other)),
        }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        match level {
            Level::Level2 => 2,
            Level::Level3 => 3,
        }
    }
}

/// Everything the renderer needs to know about what a raw file holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductDescriptor {
    pub level: Level,
    pub product: String,
    pub code: Option<String>,
    pub field: Option<String>,
}

impl Display for ProductDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level{}/{}", self.level, self.product)?;
        if let Some(code) = &self.code {
            write!(f, "/{}", code)?;
        }
        Ok(())
    }
}

/// A raw radar file found in a source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileRecord {
    pub site: String,
    pub level: Level,
    pub product: String,
    pub timestamp: DateTime<Utc>,
    pub source_key: String,
    pub code: Option<String>,
    pub normalized_key: String,
}

impl RawFileRecord {
    /// Parses a Level 2 archive key such as
    /// `2025/04/09/KPDT/KPDT20250409_153000_V06.gz`.
    ///
    /// Returns `None` for metadata (`_MDM`) files and anything else that does
    /// not carry a site and scan time.
    pub fn from_level2_key(source_key: &str, product: &str) -> Option<Self> {
        let file_name = source_key.rsplit('/').next()?;
        if file_name.contains("_MDM") {
            return None;
        }
        let normalized_key = normalize_level2_name(file_name);
        if normalized_key.len() < 19 || !normalized_key.is_char_boundary(4) {
            return None;
        }
        let (site, rest) = normalized_key.split_at(4);
        if !site.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let mut parts = rest.splitn(3, '_');
        let date = parts.next()?;
        let time = parts.next()?;
        let timestamp = parse_timestamp(date, time)?;

        Some(RawFileRecord {
            site: site.to_string(),
            level: Level::Level2,
            product: product.to_string(),
            timestamp,
            source_key: source_key.to_string(),
            code: None,
            normalized_key,
        })
    }

    /// Parses a Level 3 archive key such as
    /// `PDT/HHC/2025/04/09/PDT_HHC_2025_04_09_153000`.
    pub fn from_level3_key(source_key: &str, product: &str) -> Option<Self> {
        let file_name = source_key.rsplit('/').next()?;
        let parts: Vec<&str> = file_name.split('_').collect();
        let [site, code, year, month, day, time] = parts.as_slice() else {
            return None;
        };
        let timestamp = parse_timestamp(&format!("{}{}{}", year, month, day), time)?;
        let normalized_key = normalize_level3_name(file_name)?;

        Some(RawFileRecord {
            site: site.to_uppercase(),
            level: Level::Level3,
            product: product.to_string(),
            timestamp,
            source_key: source_key.to_string(),
            code: Some(code.to_uppercase()),
            normalized_key,
        })
    }

    pub fn descriptor(&self, field: Option<&str>) -> ProductDescriptor {
        ProductDescriptor {
            level: self.level,
            product: self.product.clone(),
            code: self.code.clone(),
            field: field.map(str::to_string),
        }
    }
}

impl Display for RawFileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.normalized_key, self.source_key)
    }
}

const ARCHIVE_EXTENSIONS: &[&str] = &[".GZ", ".BZ2"];

/// Uppercases a Level 2 file name and strips archive extensions.
pub fn normalize_level2_name(file_name: &str) -> String {
    let mut name = file_name.to_uppercase();
    for ext in ARCHIVE_EXTENSIONS {
        if let Some(stripped) = name.strip_suffix(ext) {
            name = stripped.to_string();
        }
    }
    name
}

/// `PDT_HHC_2025_04_09_153000` becomes `KPDT20250409_153000_HHC`.
pub fn normalize_level3_name(file_name: &str) -> Option<String> {
    let parts: Vec<&str> = file_name.split('_').collect();
    let [site, code, year, month, day, time] = parts.as_slice() else {
        return None;
    };
    Some(format!("K{site}{year}{month}{day}_{time}_{code}").to_uppercase())
}

/// Whether `key` has the shape produced by normalizing a file name of `level`.
pub fn is_normalized_key(level: Level, key: &str) -> bool {
    match level {
        Level::Level2 => RawFileRecord::from_level2_key(key, "")
            .is_some_and(|record| record.normalized_key == key),
        Level::Level3 => {
            let parts: Vec<&str> = key.split('_').collect();
            let [site_date, time, code] = parts.as_slice() else {
                return false;
            };
            site_date.len() == 12 &&
                site_date.is_ascii() &&
                site_date.starts_with('K') &&
                parse_timestamp(&site_date[4..], time).is_some() &&
                !code.is_empty() &&
                code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        }
    }
}

fn parse_timestamp(date: &str, time: &str) -> Option<DateTime<Utc>> {
    if date.len() != 8 || time.len() != 6 {
        return None;
    }
    NaiveDateTime::parse_from_str(&format!("{}{}", date, time), "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A downloaded raw file.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub record: RawFileRecord,
    pub payload: Bytes,
}

/// Geographic extents of a rendered sweep, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

/// Bounding box corners as `[lon, lat]` pairs, the form map clients consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Corners {
    pub nw: [f64; 2],
    pub ne: [f64; 2],
    pub se: [f64; 2],
    pub sw: [f64; 2],
}

impl BoundingBox {
    pub fn corners(&self) -> Corners {
        Corners {
            nw: [self.min_lon, self.max_lat],
            ne: [self.max_lon, self.max_lat],
            se: [self.max_lon, self.min_lat],
            sw: [self.min_lon, self.min_lat],
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .all(|v| v.is_finite()) &&
            self.min_lon <= self.max_lon &&
            self.min_lat <= self.max_lat &&
            (-90.0..=90.0).contains(&self.min_lat) &&
            (-90.0..=90.0).contains(&self.max_lat)
    }
}

/// Deterministic location of one artifact in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub level: Level,
    pub normalized_key: String,
    pub product: String,
    pub sweep: u32,
}

impl ArtifactKey {
    pub fn new(level: Level, normalized_key: &str, product: &str, sweep: u32) -> Self {
        Self {
            level,
            normalized_key: normalized_key.to_string(),
            product: product.to_string(),
            sweep,
        }
    }

    fn stem(&self) -> String {
        format!(
            "{}{}_{}_idx{}",
            self.level.artifact_prefix(),
            self.normalized_key,
            self.product,
            self.sweep
        )
    }

    pub fn image_key(&self) -> String {
        format!("{}.png", self.stem())
    }

    pub fn metadata_key(&self) -> String {
        format!("{}.json", self.stem())
    }

    /// Recovers the artifact key from a blob key written for `product`.
    /// Blobs of other products or unknown extensions yield `None`.
    pub fn parse(level: Level, product: &str, blob_key: &str) -> Option<Self> {
        let file_name = blob_key.strip_prefix(&level.artifact_prefix())?;
        let stem = file_name
            .strip_suffix(".png")
            .or_else(|| file_name.strip_suffix(".json"))?;
        let (head, sweep) = stem.rsplit_once("_idx")?;
        let sweep = sweep.parse::<u32>().ok()?;
        let normalized_key = head.strip_suffix(&format!("_{}", product))?;
        if !is_normalized_key(level, normalized_key) {
            return None;
        }
        Some(Self::new(level, normalized_key, product, sweep))
    }
}

impl Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stem())
    }
}

/// A rendered sweep ready to publish.
#[derive(Debug, Clone)]
pub struct ProcessedArtifact {
    pub key: ArtifactKey,
    pub image: Bytes,
    pub bbox: BoundingBox,
    pub product: String,
    /// Sweep of a multi-sweep volume, `None` for single-sweep products.
    pub sweep: Option<u32>,
    /// 1-based rank of the sweep among the volume's sweeps ordered by
    /// elevation angle.
    pub elevation_index: Option<u32>,
    pub elevation_angle_degrees: Option<f64>,
    pub azimuth_angle_degrees: Option<f64>,
}

impl ProcessedArtifact {
    pub fn metadata(&self) -> ArtifactMetadata {
        ArtifactMetadata {
            original_sweep_number: self.sweep.map(|s| s + 1),
            elevation_index: self.elevation_index,
            elevation_angle_degrees: self.elevation_angle_degrees,
            azimuth_angle_degrees: self.azimuth_angle_degrees,
            bounding_box_lon_lat: self.bbox.corners(),
        }
    }
}

/// Metadata document published next to every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sweep_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_angle_degrees: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azimuth_angle_degrees: Option<f64>,
    pub bounding_box_lon_lat: Corners,
}
