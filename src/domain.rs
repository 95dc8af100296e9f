use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
pub const MAX_PRECISION: usize = 12;

pub const SENTINEL_2_COLLECTION: &str = "COPERNICUS/S2";
pub const SENTINEL_2_CHANNELS: &[&str] = &[
    "B1", "B2", "B3", "B4", "B5", "B6", "B7", "B8", "B8A", "B9", "B11", "B12", "QA60",
];

pub const COPERNICUS_LAND_COVER_COLLECTION: &str = "COPERNICUS/Landcover/100m/Proba-V-C3/Global";
pub const COPERNICUS_LAND_COVER_CHANNELS: &[&str] = &[
    "discrete_classification",
    "bare-coverfraction",
    "crops-coverfraction",
    "grass-coverfraction",
    "moss-coverfraction",
    "shrub-coverfraction",
    "snow-coverfraction",
    "tree-coverfraction",
    "urban-coverfraction",
    "water-permanent-coverfraction",
    "water-seasonal-coverfraction",
];

/// A validated geohash cell code, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Geohash(String);

impl Geohash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn precision(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn from_validated(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Geohash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Geohash {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= MAX_PRECISION
            && normalized.bytes().all(|ch| GEOHASH_ALPHABET.contains(&ch));
        if !is_valid {
            return Err(HarvestError::InvalidGeohash(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Geohash {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Geohash> for String {
    fn from(value: Geohash) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionId(String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name for this collection.
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Channels fetched when the caller does not name any.
    pub fn default_channels(&self) -> Result<Vec<String>, HarvestError> {
        let preset = match self.0.as_str() {
            SENTINEL_2_COLLECTION => SENTINEL_2_CHANNELS,
            COPERNICUS_LAND_COVER_COLLECTION => COPERNICUS_LAND_COVER_CHANNELS,
            _ => return Err(HarvestError::UnknownChannels(self.0.clone())),
        };
        Ok(preset.iter().map(|band| band.to_string()).collect())
    }

    pub fn resolve_channels(&self, explicit: Option<Vec<String>>) -> Result<Vec<String>, HarvestError> {
        match explicit {
            Some(channels) if !channels.is_empty() => Ok(channels),
            _ => self.default_channels(),
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(HarvestError::InvalidCollection(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for CollectionId {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CollectionId> for String {
    fn from(value: CollectionId) -> Self {
        value.0
    }
}

/// Identity of a fetch request: `{geohash}_{window start}`.
///
/// The collection is deliberately absent so the same key addresses the same
/// tile and window in every collection a manifest is replayed against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey {
    geohash: Geohash,
    start: NaiveDate,
}

impl RequestKey {
    pub fn new(geohash: Geohash, start: NaiveDate) -> Self {
        Self { geohash, start }
    }

    pub fn geohash(&self) -> &Geohash {
        &self.geohash
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.geohash, self.start.format("%Y-%m-%d"))
    }
}

impl FromStr for RequestKey {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (geohash, date) = value
            .trim()
            .split_once('_')
            .ok_or_else(|| HarvestError::InvalidInput(format!("malformed request key: {value}")))?;
        let start = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| HarvestError::InvalidInput(format!("malformed request key: {value}")))?;
        Ok(Self {
            geohash: geohash.parse()?,
            start,
        })
    }
}

impl TryFrom<String> for RequestKey {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestKey> for String {
    fn from(value: RequestKey) -> Self {
        value.to_string()
    }
}
