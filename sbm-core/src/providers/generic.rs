//! Last-resort resolver: fetch the preview page and either trust its
//! `Content-Type`, or scrape it for an absolute/relative link matching the
//! PDF/XML predicates.

use scraper::{Html, Selector};

use sbm_common::error::CoreError;

use crate::http_fetcher::{HttpFetcher, UserAgentMode};
use crate::link_scorer::{is_direct_pdf_url, is_direct_xml_url};
use crate::providers::ResolvedUrls;

const SCRAPE_MAX_BYTES: usize = 2 * 1024 * 1024;

pub async fn resolve(fetcher: &HttpFetcher, url: &str) -> Result<ResolvedUrls, CoreError> {
    let resp = fetcher.get(url, UserAgentMode::Service, SCRAPE_MAX_BYTES).await?;

    if let Some(ct) = &resp.content_type {
        if ct.contains("pdf") {
            return Ok(ResolvedUrls { pdf_url: Some(resp.final_url), xml_url: None });
        }
        if ct.contains("xml") {
            return Ok(ResolvedUrls { pdf_url: None, xml_url: Some(resp.final_url) });
        }
    }

    let body = String::from_utf8_lossy(&resp.body);
    let candidates = extract_candidate_urls(&body, &resp.final_url);

    let pdf_url = candidates.iter().find(|u| is_direct_pdf_url(u)).cloned();
    let xml_url = candidates.iter().find(|u| is_direct_xml_url(u)).cloned();
    Ok(ResolvedUrls { pdf_url, xml_url })
}

fn extract_candidate_urls(html: &str, base: &str) -> Vec<String> {
    let base_url = match reqwest::Url::parse(base) {
        Ok(u) => u,
        Err(_) => return Vec::new(),
    };
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a, link, script") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|el| el.value().attr("href").or_else(|| el.value().attr("src")))
        .filter_map(|href| base_url.join(href).ok())
        .map(|u| u.to_string())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_and_resolves_relative_links() {
        let html = r#"<a href="download.xml">x</a><a href="https://x.test/a.pdf">y</a>"#;
        let urls = extract_candidate_urls(html, "https://x.test/page");
        assert!(urls.iter().any(|u| u == "https://x.test/download.xml"));
        assert!(urls.iter().any(|u| u == "https://x.test/a.pdf"));
    }
}
