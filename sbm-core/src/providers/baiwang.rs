//! Baiwang (百望) short-link and preview-URL resolution.
//!
//! A short link (`u.baiwang.com/k…`) HEAD-follows to a preview URL; a
//! preview URL (`pis.baiwang.com/smkp-vue/previewInvoiceAllEle?param=<P>`)
//! carries the opaque `param` that both direct download URLs need.

use sbm_common::error::CoreError;

use crate::http_fetcher::HttpFetcher;
use crate::providers::ResolvedUrls;

const SHORT_LINK_HOST: &str = "u.baiwang.com";
const PREVIEW_HOST: &str = "pis.baiwang.com";
const PREVIEW_PATH: &str = "/smkp-vue/previewInvoiceAllEle";
const SHORT_LINK_MAX_REDIRECTS: usize = 2;

pub fn is_short_link(url: &str) -> bool {
    super::host_of(url).is_some_and(|h| h == SHORT_LINK_HOST)
}

pub fn is_preview_link(url: &str) -> bool {
    super::host_of(url).is_some_and(|h| h == PREVIEW_HOST) && url.contains(PREVIEW_PATH)
}

/// Resolve a `u.baiwang.com` short link to its preview URL, then derive the
/// direct download URLs from the preview's `param`.
pub async fn resolve_short_link(
    fetcher: &HttpFetcher,
    url: &str,
) -> Result<ResolvedUrls, CoreError> {
    let preview = fetcher.head_follow(url, SHORT_LINK_MAX_REDIRECTS).await?;
    resolve_preview_link(&preview)
}

/// Derive `…/bwmg/mix/bw/downloadFormat?param=<P>&formatType={PDF,XML}` from
/// a preview URL's `param` query parameter.
pub fn resolve_preview_link(preview_url: &str) -> Result<ResolvedUrls, CoreError> {
    let parsed = reqwest::Url::parse(preview_url)
        .map_err(|e| CoreError::provider_resolve_failed(format!("bad baiwang preview url: {e}")))?;
    let param = parsed
        .query_pairs()
        .find(|(k, _)| k == "param")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| CoreError::provider_resolve_failed("baiwang preview url missing param"))?;

    let base = format!(
        "https://{PREVIEW_HOST}/bwmg/mix/bw/downloadFormat?param={param}"
    );
    Ok(ResolvedUrls {
        pdf_url: Some(format!("{base}&formatType=PDF")),
        xml_url: Some(format!("{base}&formatType=XML")),
    })
}

/// Best-effort entry point: routes a URL to whichever Baiwang path applies.
pub async fn resolve(fetcher: &HttpFetcher, url: &str) -> Result<ResolvedUrls, CoreError> {
    if is_short_link(url) {
        resolve_short_link(fetcher, url).await
    } else if is_preview_link(url) {
        resolve_preview_link(url)
    } else {
        Err(CoreError::provider_resolve_failed("not a baiwang url"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_short_and_preview_links() {
        assert!(is_short_link("http://u.baiwang.com/k5pE5SNf1ld"));
        assert!(is_preview_link(
            "https://pis.baiwang.com/smkp-vue/previewInvoiceAllEle?param=abc123"
        ));
        assert!(!is_short_link("https://pis.baiwang.com/smkp-vue/previewInvoiceAllEle?param=abc123"));
    }

    #[test]
    fn derives_pdf_and_xml_from_preview_param() {
        let resolved = resolve_preview_link(
            "https://pis.baiwang.com/smkp-vue/previewInvoiceAllEle?param=P123",
        )
        .unwrap();
        assert_eq!(
            resolved.pdf_url.as_deref(),
            Some("https://pis.baiwang.com/bwmg/mix/bw/downloadFormat?param=P123&formatType=PDF")
        );
        assert_eq!(
            resolved.xml_url.as_deref(),
            Some("https://pis.baiwang.com/bwmg/mix/bw/downloadFormat?param=P123&formatType=XML")
        );
        assert!(resolved.is_complete());
    }

    #[test]
    fn missing_param_is_an_error() {
        assert!(resolve_preview_link("https://pis.baiwang.com/smkp-vue/previewInvoiceAllEle").is_err());
    }
}
