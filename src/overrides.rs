use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::model::Coordinate;

/// Hand-maintained coordinates for addresses the provider never gets right.
///
/// Keys are matched verbatim against the raw feed address: no trimming, no
/// case folding, no normalization.
#[derive(Debug, Clone, Default)]
pub struct ManualOverrideStore {
    entries: HashMap<String, Coordinate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OverrideEntry {
    Pair([f64; 2]),
    Object { lat: f64, lon: f64 },
}

impl From<OverrideEntry> for Coordinate {
    fn from(entry: OverrideEntry) -> Self {
        match entry {
            OverrideEntry::Pair([lat, lon]) => Coordinate::new(lat, lon),
            OverrideEntry::Object { lat, lon } => Coordinate::new(lat, lon),
        }
    }
}

impl ManualOverrideStore {
    pub fn new<I, K>(entries: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (K, Coordinate)>,
        K: Into<String>,
    {
        let mut map = HashMap::new();
        for (address, coordinate) in entries {
            let address = address.into();
            if !coordinate.is_on_earth() {
                return Err(AppError::Config(format!(
                    "manual override for {address:?} has invalid coordinate {coordinate}"
                )));
            }
            map.insert(address, coordinate);
        }
        Ok(Self { entries: map })
    }

    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let raw: HashMap<String, OverrideEntry> = serde_json::from_str(json)?;
        Self::new(raw.into_iter().map(|(k, v)| (k, Coordinate::from(v))))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path)?;
        let store = Self::from_json_str(&contents)?;
        debug!(path = %path.display(), entries = store.len(), "loaded manual overrides");
        Ok(store)
    }

    pub fn lookup(&self, raw_address: &str) -> Option<Coordinate> {
        self.entries.get(raw_address).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BETHEL: &str = "121 Bethel Harvest Dr Nicholasville, KY 40356";

    #[test]
    fn matches_only_verbatim_keys() {
        let store =
            ManualOverrideStore::new([(BETHEL, Coordinate::new(37.8814, -84.5730))]).unwrap();
        assert_eq!(store.lookup(BETHEL), Some(Coordinate::new(37.8814, -84.5730)));
        assert_eq!(store.lookup(&BETHEL.to_lowercase()), None);
        assert_eq!(store.lookup(&format!(" {BETHEL}")), None);
        assert_eq!(
            store.lookup("121 Bethel Harvest Drive Nicholasville, KY 40356"),
            None
        );
    }

    #[test]
    fn loads_both_entry_shapes_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        std::fs::write(
            &path,
            r#"{
                "121 Bethel Harvest Dr Nicholasville, KY 40356": [37.8814, -84.5730],
                "PO Box 12, Paris, KY": {"lat": 38.2098, "lon": -84.2530}
            }"#,
        )
        .unwrap();

        let store = ManualOverrideStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.lookup("PO Box 12, Paris, KY"),
            Some(Coordinate::new(38.2098, -84.2530))
        );
    }

    #[test]
    fn rejects_impossible_coordinates() {
        let result = ManualOverrideStore::from_json_str(r#"{"Nowhere": [123.0, 10.0]}"#);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
