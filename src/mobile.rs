use crate::model::Record;

pub const DEFAULT_MOBILE_KEYWORDS: &[&str] = &["mobile", "truck", "cart", "trailer"];

/// Keyword classifier for vendors without a fixed location.
///
/// Plain substring matching on purpose: "Trailer Ave" is a false positive
/// that has to be fixed in the feed, not here.
#[derive(Debug, Clone)]
pub struct MobileVendorFilter {
    keywords: Vec<String>,
}

impl Default for MobileVendorFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MOBILE_KEYWORDS.iter().copied())
    }
}

impl MobileVendorFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn is_mobile(&self, record: &Record) -> bool {
        self.matches(&record.raw_address) || self.matches(&record.name)
    }

    fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|keyword| text.contains(keyword))
    }
}
