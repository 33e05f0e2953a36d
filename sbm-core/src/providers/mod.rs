//! Provider-specific link resolvers, tried before falling back to generic
//! scraping. Each resolver turns a short/portal link into direct PDF and/or
//! XML download URLs.

pub mod baiwang;
pub mod generic;
pub mod nuonuo;

/// The outcome of a provider resolution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUrls {
    pub pdf_url: Option<String>,
    pub xml_url: Option<String>,
}

impl ResolvedUrls {
    pub fn is_complete(&self) -> bool {
        self.pdf_url.is_some() && self.xml_url.is_some()
    }

    pub fn merge(&mut self, other: ResolvedUrls) {
        if self.pdf_url.is_none() {
            self.pdf_url = other.pdf_url;
        }
        if self.xml_url.is_none() {
            self.xml_url = other.xml_url;
        }
    }
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
}
