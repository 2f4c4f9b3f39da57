use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::errors::{AppError, AppResult};
use crate::model::{AddressCandidate, Record};

/// Street-type abbreviations and their canonical spelling.
pub const DEFAULT_STREET_TYPES: &[(&str, &str)] = &[
    ("Dr", "Drive"),
    ("St", "Street"),
    ("Ave", "Avenue"),
    ("Rd", "Road"),
    ("Blvd", "Boulevard"),
    ("Cir", "Circle"),
    ("Ln", "Lane"),
    ("Ct", "Court"),
    ("Pkwy", "Parkway"),
    ("Hwy", "Highway"),
];

static UNIT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\b(?:suite|ste|unit|apt)\b\.?(?:\s*#\s*|\s+)|#\s*)[a-z0-9-]+")
        .expect("unit pattern")
});

static TRAILING_ZIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\s*$").expect("zip pattern"));

/// Region appended to queries that do not already name it, e.g. `KY` /
/// `Kentucky` for a single-state feed.
#[derive(Debug, Clone)]
pub struct RegionHint {
    code: String,
    name: Option<String>,
    code_pattern: Regex,
}

impl RegionHint {
    pub fn new(code: impl Into<String>, name: Option<String>) -> AppResult<Self> {
        let code = code.into().trim().to_string();
        if code.is_empty() {
            return Err(AppError::Config("region code must not be empty".into()));
        }
        let code_pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&code)))
            .map_err(|err| AppError::Config(format!("invalid region code {code:?}: {err}")))?;
        Ok(Self {
            code,
            name: name.filter(|n| !n.trim().is_empty()),
            code_pattern,
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn is_mentioned_in(&self, address: &str) -> bool {
        if self.code_pattern.is_match(address) {
            return true;
        }
        self.name
            .as_ref()
            .map(|name| address.to_lowercase().contains(&name.to_lowercase()))
            .unwrap_or(false)
    }

    fn qualify(&self, address: &str, county: Option<&str>) -> String {
        match county {
            Some(county) if !TRAILING_ZIP.is_match(address) => {
                format!("{address}, {county} County, {}", self.code)
            }
            _ => format!("{address}, {}", self.code),
        }
    }
}

/// Bidirectional street-type table compiled into two word-boundary matchers.
#[derive(Debug, Clone)]
struct StreetTypes {
    to_full: HashMap<String, String>,
    to_abbrev: HashMap<String, String>,
    abbrev_pattern: Option<Regex>,
    full_pattern: Option<Regex>,
}

impl StreetTypes {
    fn new(pairs: &[(&str, &str)]) -> AppResult<Self> {
        let mut to_full = HashMap::new();
        let mut to_abbrev = HashMap::new();
        for (abbrev, full) in pairs {
            to_full.insert(abbrev.to_string(), full.to_string());
            to_abbrev.insert(full.to_lowercase(), abbrev.to_string());
        }
        // Abbreviations are case-sensitive so that state codes such as "CT"
        // are left alone; full words match in any case.
        let abbrev_pattern = alternation(pairs.iter().map(|(a, _)| *a), r"\b(", r")\b\.?")?;
        let full_pattern = alternation(pairs.iter().map(|(_, f)| *f), r"(?i)\b(", r")\b")?;
        Ok(Self {
            to_full,
            to_abbrev,
            abbrev_pattern,
            full_pattern,
        })
    }

    /// Expands abbreviations when any are present, otherwise abbreviates the
    /// full spellings. Returns `None` when the address has no street type.
    fn swap(&self, address: &str) -> Option<String> {
        if let Some(pattern) = self.abbrev_pattern.as_ref().filter(|p| p.is_match(address)) {
            let swapped = pattern.replace_all(address, |caps: &Captures<'_>| {
                self.to_full
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            });
            return Some(swapped.into_owned());
        }
        if let Some(pattern) = self.full_pattern.as_ref().filter(|p| p.is_match(address)) {
            let swapped = pattern.replace_all(address, |caps: &Captures<'_>| {
                self.to_abbrev
                    .get(&caps[1].to_lowercase())
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            });
            return Some(swapped.into_owned());
        }
        None
    }
}

fn alternation<'a>(
    words: impl Iterator<Item = &'a str>,
    prefix: &str,
    suffix: &str,
) -> AppResult<Option<Regex>> {
    let words = words.map(regex::escape).collect::<Vec<_>>();
    if words.is_empty() {
        return Ok(None);
    }
    let pattern = format!("{prefix}{}{suffix}", words.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|err| AppError::Config(format!("invalid street type table: {err}")))
}

/// Turns one raw feed address into an ordered list of provider queries.
///
/// Order: unit comma insertion, street-type swap with and without it,
/// unit-stripped, region-qualified, and finally the verbatim input.
#[derive(Debug, Clone)]
pub struct AddressNormalizer {
    street_types: StreetTypes,
    region: Option<RegionHint>,
}

impl Default for AddressNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_STREET_TYPES, None).expect("default street types compile")
    }
}

impl AddressNormalizer {
    pub fn new(street_types: &[(&str, &str)], region: Option<RegionHint>) -> AppResult<Self> {
        Ok(Self {
            street_types: StreetTypes::new(street_types)?,
            region,
        })
    }

    pub fn with_region(mut self, region: RegionHint) -> Self {
        self.region = Some(region);
        self
    }

    pub fn generate_candidates(&self, raw_address: &str) -> Vec<AddressCandidate> {
        self.build(raw_address, None)
    }

    pub fn candidates_for(&self, record: &Record) -> Vec<AddressCandidate> {
        self.build(&record.raw_address, record.county.as_deref())
    }

    fn build(&self, raw_address: &str, county: Option<&str>) -> Vec<AddressCandidate> {
        let base = tidy(raw_address);
        let with_commas = insert_unit_commas(&base);

        let mut derived: Vec<String> = Vec::with_capacity(6);
        if let Some(formatted) = &with_commas {
            derived.push(formatted.clone());
            derived.extend(self.street_types.swap(formatted));
        }
        derived.push(base.clone());
        derived.extend(self.street_types.swap(&base));
        derived.extend(strip_unit(&base));

        if let Some(region) = &self.region {
            if !base.is_empty() && !region.is_mentioned_in(&base) {
                let primary = derived.first().cloned().unwrap_or_else(|| base.clone());
                derived.push(region.qualify(&primary, county));
            }
        }

        let mut candidates: Vec<AddressCandidate> = Vec::with_capacity(derived.len() + 1);
        for query in derived {
            if query.is_empty() || query == raw_address {
                continue;
            }
            let candidate = AddressCandidate::new(query);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates.push(AddressCandidate::new(raw_address));
        candidates
    }
}

/// Trims, collapses runs of whitespace and removes spaces before commas.
fn tidy(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(" ,", ",")
}

fn find_unit(address: &str) -> Option<(usize, usize)> {
    UNIT_TOKEN
        .find_iter(address)
        .find(|m| !address[..m.start()].trim().is_empty())
        .map(|m| (m.start(), m.end()))
}

/// `"101 W Loudon Ave Suite 160 Lexington, KY"` becomes
/// `"101 W Loudon Ave, Suite 160, Lexington, KY"`.
fn insert_unit_commas(address: &str) -> Option<String> {
    let (start, end) = find_unit(address)?;
    let before = address[..start].trim_end();
    let unit = &address[start..end];
    let after = address[end..].trim_start();

    let lead = if before.ends_with(',') {
        format!("{before} ")
    } else {
        format!("{before}, ")
    };
    let formatted = if after.is_empty() || after.starts_with(',') {
        format!("{lead}{unit}{after}")
    } else {
        format!("{lead}{unit}, {after}")
    };
    (formatted != address).then_some(formatted)
}

fn strip_unit(address: &str) -> Option<String> {
    let (start, end) = find_unit(address)?;
    let before = address[..start].trim_end().trim_end_matches(',').trim_end();
    let after = address[end..].trim_start().trim_start_matches(',').trim_start();
    if after.is_empty() {
        Some(before.to_string())
    } else {
        Some(format!("{before}, {after}"))
    }
}
