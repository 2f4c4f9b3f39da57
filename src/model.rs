use std::fmt;

use serde::{Deserialize, Serialize};

/// One geocodable entry from the feed. A spreadsheet row produces one record
/// per populated address column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub raw_address: String,
    pub county: Option<String>,
    pub row_number: usize,
    pub location_index: u8,
}

impl Record {
    pub fn new(name: impl Into<String>, raw_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw_address: raw_address.into(),
            county: None,
            row_number: 0,
            location_index: 1,
        }
    }

    pub fn with_county(mut self, county: impl Into<String>) -> Self {
        let county = county.into();
        self.county = if county.trim().is_empty() {
            None
        } else {
            Some(county)
        };
        self
    }

    pub fn at_row(mut self, row_number: usize, location_index: u8) -> Self {
        self.row_number = row_number;
        self.location_index = location_index;
        self
    }

    pub fn has_address(&self) -> bool {
        !self.raw_address.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_on_earth(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}, {:.4}", self.lat, self.lon)
    }
}

/// Rectangular area used to reject provider answers that land somewhere
/// the data set cannot be.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&coordinate.lat)
            && (self.min_lon..=self.max_lon).contains(&coordinate.lon)
    }

    /// Parses `min_lat,min_lon,max_lat,max_lon`.
    pub fn parse(value: &str) -> Option<Self> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        match parts.as_slice() {
            [min_lat, min_lon, max_lat, max_lon] if min_lat <= max_lat && min_lon <= max_lon => {
                Some(Self {
                    min_lat: *min_lat,
                    min_lon: *min_lon,
                    max_lat: *max_lat,
                    max_lon: *max_lon,
                })
            }
            _ => None,
        }
    }
}

/// Plausibility policy applied to every coordinate before it is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlausibilityBound {
    pub bounding_box: Option<BoundingBox>,
}

impl PlausibilityBound {
    pub fn new(bounding_box: Option<BoundingBox>) -> Self {
        Self { bounding_box }
    }

    pub fn accepts(&self, coordinate: &Coordinate) -> bool {
        if !coordinate.is_on_earth() {
            return false;
        }
        // (0, 0) is what broken geocoders emit for "unknown".
        if coordinate.lat == 0.0 && coordinate.lon == 0.0 {
            return false;
        }
        self.bounding_box
            .map(|bbox| bbox.contains(coordinate))
            .unwrap_or(true)
    }
}

/// A rewritten query for one raw address. Position in the candidate list is
/// its priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressCandidate(String);

impl AddressCandidate {
    pub fn new(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
