//! Ranks candidate invoice-preview URLs found in an email body, and picks
//! the best anchor out of an HTML-rendered body.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(https?://[^\s"'<>]+|//[^\s"'<>]+\.[a-zA-Z]{2,}[^\s"'<>]*)"#).unwrap());

static BASE64_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{32,}={0,2}").unwrap());

const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".css", ".js", ".woff", ".woff2", ".ttf", ".ico",
];

const BAIWANG_PREVIEW_HOSTS: &[&str] = &["pis.baiwang.com"];
const BAIWANG_SHORT_HOSTS: &[&str] = &["u.baiwang.com"];
const NUONUO_SHORT_HOSTS: &[&str] = &["nnfp.jss.com.cn", "of1.cn"];
const NUONUO_PORTAL_HOSTS: &[&str] = &["fp.nuonuo.com"];
const NUONUO_PRODUCT_HOSTS: &[&str] = &["nst.nuonuo.com", "www.nuonuo.com"];
const DIRECT_DOWNLOAD_HOSTS: &[&str] = &["download.nuonuo.com"];
const TRACKING_HOSTS: &[&str] = &["linktrace.triggerdelivery.com"];

const CTA_LABELS: &[&str] = &["下载发票", "查看发票", "点击链接查看发票"];

/// Rank `urls` found in plain body text. Higher is better; callers typically
/// want `max_by_key`.
pub fn score_url(url: &str) -> i64 {
    let lower = url.to_ascii_lowercase();
    let mut score: i64 = 0;

    if ASSET_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
        score -= 1000;
    }
    if TRACKING_HOSTS.iter().any(|h| lower.contains(h)) {
        score -= 2000;
    }
    if NUONUO_PRODUCT_HOSTS.iter().any(|h| lower.contains(h)) {
        score -= 800;
    }

    if BAIWANG_PREVIEW_HOSTS.iter().any(|h| lower.contains(h)) {
        score += 500;
    }
    if BAIWANG_SHORT_HOSTS.iter().any(|h| lower.contains(h)) {
        score += 450;
    }
    if NUONUO_SHORT_HOSTS.iter().any(|h| lower.contains(h)) {
        score += 395;
    }
    if NUONUO_PORTAL_HOSTS.iter().any(|h| lower.contains(h)) {
        score += 300;
    }
    if DIRECT_DOWNLOAD_HOSTS.iter().any(|h| lower.contains(h)) {
        score += 220;
    }

    if lower.contains("previewinvoiceallele") {
        score += 250;
    }
    if lower.contains("/scan-invoice/printqrcode") && lower.contains("paramlist=") {
        score += 250;
    }
    if lower.contains(".pdf") || lower.contains("formattype=pdf") {
        score += 900;
    }
    if lower.contains(".xml") || lower.contains("formattype=xml") {
        score += 850;
    }
    if (lower.contains("param=") || lower.contains("paramlist=")) && score < 850 {
        score += 120;
    }

    if lower.contains("/scan-invoice/invoiceshow") {
        score -= 200;
    }
    if is_nuonuo_portal_root(&lower) {
        score -= 600;
    }

    score
}

fn is_nuonuo_portal_root(lower: &str) -> bool {
    NUONUO_PORTAL_HOSTS.iter().any(|h| lower.contains(h))
        && (lower.ends_with('/') || lower.ends_with("/#/") || lower.ends_with('#'))
}

/// Find every URL in `text`, expanding common redirect-wrapper query params
/// (`content`, `url`, `redirect`, `target`) to their inner target first, plus
/// any URLs recovered from base64-encoded runs (some senders base64 the
/// entire body or just the link).
pub fn find_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = URL_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .flat_map(|url| {
            let mut out = vec![url.clone()];
            if let Some(inner) = unwrap_redirect_param(&url) {
                out.push(inner);
            }
            out
        })
        .collect();
    urls.extend(find_urls_in_base64_runs(text));
    urls
}

/// Scans `text` for base64-looking runs, decodes each, and extracts any URLs
/// found in the decoded bytes. Runs that don't decode as valid base64 or UTF-8
/// are skipped; this is a best-effort recovery, not a full body decode.
fn find_urls_in_base64_runs(text: &str) -> Vec<String> {
    BASE64_RUN_RE
        .find_iter(text)
        .filter_map(|m| BASE64.decode(m.as_str()).ok())
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .flat_map(|decoded| URL_RE.find_iter(&decoded).map(|m| m.as_str().to_string()).collect::<Vec<_>>())
        .collect()
}

fn unwrap_redirect_param(url: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    for param in ["content", "url", "redirect", "target"] {
        let prefix = format!("{param}=");
        for part in query.split('&') {
            if let Some(value) = part.strip_prefix(&prefix) {
                if let Ok(decoded) = urlencoding_decode(value) {
                    if decoded.starts_with("http://") || decoded.starts_with("https://") {
                        return Some(decoded);
                    }
                }
            }
        }
    }
    None
}

/// Minimal percent-decoder; avoids pulling in a whole `urlencoding` crate for
/// one call site.
fn urlencoding_decode(s: &str) -> Result<String, ()> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).map_err(|_| ())?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| ())?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ())
}

/// Returns the single best URL from plain body text, if any.
pub fn best_preview_url_from_text(text: &str) -> Option<String> {
    find_urls(text).into_iter().max_by_key(|u| score_url(u))
}

/// HTML-aware picker: prefers an anchor whose visible text contains a CTA
/// label and whose href is non-tracking; falls back to the first anchor
/// after such a label in document order; tracking-only anchors are a last
/// resort.
pub fn best_invoice_preview_url_from_body(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("a").ok()?;

    let mut cta_match = None;
    let mut after_cta_label = None;
    let mut saw_cta_label = false;
    let mut tracking_fallback = None;

    for anchor in doc.select(&selector) {
        let href = anchor.value().attr("href").map(str::to_string);
        let text: String = anchor.text().collect();
        let is_tracking = href
            .as_deref()
            .map(|h| TRACKING_HOSTS.iter().any(|t| h.contains(t)))
            .unwrap_or(false);

        let has_cta = CTA_LABELS.iter().any(|label| text.contains(label));

        if let Some(href) = href {
            if has_cta && !is_tracking && cta_match.is_none() {
                cta_match = Some(href.clone());
            }
            if saw_cta_label && after_cta_label.is_none() && !is_tracking {
                after_cta_label = Some(href.clone());
            }
            if is_tracking && tracking_fallback.is_none() {
                tracking_fallback = Some(href.clone());
            }
        }
        if has_cta {
            saw_cta_label = true;
        }
    }

    cta_match.or(after_cta_label).or(tracking_fallback)
}

/// PDF/XML direct-download predicates, shared by the parse pipeline and the
/// provider resolvers.
pub fn is_direct_pdf_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains(".pdf") || lower.contains("formattype=pdf")
}

pub fn is_direct_xml_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains(".xml") || lower.contains("formattype=xml") || (lower.contains(".zip") && lower.contains("/xml/"))
}

/// Asset links, the NuoNuo generic landing page, and portal roots are never
/// useful preview URLs.
pub fn is_bad_email_preview_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ASSET_EXTENSIONS.iter().any(|ext| lower.contains(ext))
        || lower.contains("/scan-invoice/invoiceshow")
        || is_nuonuo_portal_root(&lower)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn baiwang_short_link_scores_above_tracking() {
        let baiwang = "http://u.baiwang.com/k5pE5SNf1ld";
        let tracking = "https://linktrace.triggerdelivery.com/abc";
        assert!(score_url(baiwang) > score_url(tracking));
    }

    #[test]
    fn direct_pdf_and_xml_predicates() {
        assert!(is_direct_pdf_url("https://x/downloadFormat?param=P&formatType=PDF"));
        assert!(is_direct_xml_url("https://x/downloadFormat?param=P&formatType=XML"));
        assert!(!is_direct_pdf_url("https://x/invoiceShow"));
    }

    #[test]
    fn cta_html_picker_prefers_non_tracking_cta() {
        let html = r#"
            <a href="https://nnfp.jss.com.cn/8_CszRwjaw-FBnv">下载发票</a>
            <a href="https://nst.nuonuo.com/#/">诺税通</a>
        "#;
        let chosen = best_invoice_preview_url_from_body(html).unwrap();
        assert_eq!(chosen, "https://nnfp.jss.com.cn/8_CszRwjaw-FBnv");
    }

    #[test]
    fn bad_preview_urls_are_filtered() {
        assert!(is_bad_email_preview_url("https://cdn.example.com/logo.png"));
        assert!(is_bad_email_preview_url("https://fp.nuonuo.com/#/"));
        assert!(!is_bad_email_preview_url(
            "https://pis.baiwang.com/bwmg/mix/bw/downloadFormat?param=P&formatType=PDF"
        ));
    }

    #[test]
    fn portal_root_scores_low() {
        assert!(score_url("https://fp.nuonuo.com/#/") < 0);
    }

    #[test]
    fn recovers_url_from_base64_encoded_body() {
        let encoded = BASE64.encode("click here: https://pis.baiwang.com/bwmg/mix/bw/downloadFormat?param=P");
        let body = format!("view this email as base64:\n{encoded}\n");
        let best = best_preview_url_from_text(&body).unwrap();
        assert_eq!(best, "https://pis.baiwang.com/bwmg/mix/bw/downloadFormat?param=P");
    }
}
