use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::model::Record;

const MIN_CELLS: usize = 3;
const FETCH_TIMEOUT_SECS: u64 = 30;

/// Column positions in the spreadsheet export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    name: usize,
    address1: usize,
    address2: usize,
    county: usize,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            name: 0,
            address1: 1,
            address2: 2,
            county: 5,
        }
    }
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> Self {
        let defaults = Self::default();
        let find = |aliases: &[&str]| {
            header.iter().position(|cell| {
                let cell = cell.trim().to_lowercase();
                aliases.iter().any(|alias| cell == *alias)
            })
        };
        Self {
            name: find(&["name", "business", "business name"]).unwrap_or(defaults.name),
            address1: find(&["address1", "address 1", "address"]).unwrap_or(defaults.address1),
            address2: find(&["address2", "address 2"]).unwrap_or(defaults.address2),
            county: find(&["county"]).unwrap_or(defaults.county),
        }
    }
}

fn cell(row: &csv::StringRecord, index: usize) -> &str {
    row.get(index).map(str::trim).unwrap_or("")
}

/// Converts a spreadsheet CSV export into records. The first row is the header.
///
/// Rows with fewer than three cells are ignored. A populated second address
/// column yields an extra record named `"<name> (Location 2)"`. Rows without
/// any address still yield a record so that the report accounts for them.
pub fn parse_feed<R: Read>(reader: R) -> AppResult<Vec<Record>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut rows = csv_reader.records();
    let header = match rows.next() {
        Some(header) => header?,
        None => return Ok(Vec::new()),
    };
    let columns = Columns::from_header(&header);
    debug!(?columns, "resolved feed columns");

    let mut records = Vec::new();
    for (offset, row) in rows.enumerate() {
        let row = row?;
        let data_index = offset + 1;
        let row_number = data_index + 1;
        if row.len() < MIN_CELLS {
            continue;
        }

        let name = match cell(&row, columns.name) {
            "" => format!("Location {data_index}"),
            name => name.to_string(),
        };
        let county = cell(&row, columns.county);
        let address1 = cell(&row, columns.address1);
        let address2 = cell(&row, columns.address2);

        records.push(
            Record::new(name.clone(), address1)
                .with_county(county)
                .at_row(row_number, 1),
        );
        if !address2.is_empty() {
            records.push(
                Record::new(format!("{name} (Location 2)"), address2)
                    .with_county(county)
                    .at_row(row_number, 2),
            );
        }
    }
    Ok(records)
}

/// Loads the feed from a local path or an `http(s)` URL.
pub async fn load_feed(source: &str) -> AppResult<Vec<Record>> {
    let records = if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;
        let body = client
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_feed(body.as_ref())?
    } else {
        let path = Path::new(source);
        if !path.exists() {
            return Err(AppError::Feed(format!("{source} does not exist")));
        }
        parse_feed(std::fs::File::open(path)?)?
    };
    info!(source, records = records.len(), "loaded address feed");
    Ok(records)
}
