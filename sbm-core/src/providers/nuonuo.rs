//! NuoNuo (诺诺) short-link, portal-link, and detail-API resolution.
//!
//! A short link (`nnfp.jss.com.cn`, `of1.cn`) browser-UA-redirects to a
//! `/scan-invoice/printQrcode?paramList=…` URL; a portal link
//! (`fp.nuonuo.com/#/…`) carries the same `paramList` in its fragment query.
//! Either way, `paramList` plus a handful of fixed form fields are POSTed to
//! a detail endpoint that returns the direct PDF/XML URLs.

use serde::Deserialize;

use sbm_common::error::CoreError;

use crate::http_fetcher::{HttpFetcher, UserAgentMode};
use crate::providers::ResolvedUrls;

const SHORT_LINK_HOSTS: &[&str] = &["nnfp.jss.com.cn", "of1.cn"];
const PORTAL_HOST: &str = "fp.nuonuo.com";
const DETAIL_SHOW_URL: &str = "https://fp.nuonuo.com/scan2/getIvcDetailShow.do";
const DETAIL_OUTER_URL: &str = "https://fp.nuonuo.com/invoice/scan/IvcDetail.do";

pub fn is_short_link(url: &str) -> bool {
    super::host_of(url).is_some_and(|h| SHORT_LINK_HOSTS.iter().any(|s| h == *s))
}

pub fn is_portal_link(url: &str) -> bool {
    super::host_of(url).is_some_and(|h| h == PORTAL_HOST)
}

/// Extract `paramList` from either a querystring or a `#/path?paramList=…`
/// fragment.
fn extract_param_list(url: &str) -> Option<String> {
    let (_, query_part) = if let Some(idx) = url.find('#') {
        let frag = &url[idx + 1..];
        let query = frag.split_once('?').map(|(_, q)| q).unwrap_or("");
        (frag, query.to_string())
    } else {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        (url, query.to_string())
    };
    query_part
        .split('&')
        .find_map(|part| part.strip_prefix("paramList=").map(str::to_string))
}

pub async fn resolve_short_link(
    fetcher: &HttpFetcher,
    url: &str,
) -> Result<ResolvedUrls, CoreError> {
    let resp = fetcher.get(url, UserAgentMode::ChromeBrowser, 64 * 1024).await?;
    let param_list = extract_param_list(&resp.final_url).ok_or_else(|| {
        CoreError::provider_resolve_failed("nuonuo short link did not resolve to a paramList")
    })?;
    fetch_detail(fetcher, &param_list, &resp.final_url).await
}

pub fn portal_param_list(url: &str) -> Result<String, CoreError> {
    extract_param_list(url)
        .ok_or_else(|| CoreError::provider_resolve_failed("nuonuo portal link missing paramList"))
}

pub async fn resolve_portal_link(
    fetcher: &HttpFetcher,
    url: &str,
) -> Result<ResolvedUrls, CoreError> {
    let param_list = portal_param_list(url)?;
    fetch_detail(fetcher, &param_list, url).await
}

#[derive(Deserialize)]
struct DetailResponse {
    status: String,
    data: Option<DetailData>,
}

#[derive(Deserialize)]
struct DetailData {
    #[serde(rename = "invoiceSimpleVo")]
    invoice_simple_vo: Option<InvoiceSimpleVo>,
}

#[derive(Deserialize)]
struct InvoiceSimpleVo {
    url: Option<String>,
    #[serde(rename = "xmlUrl")]
    xml_url: Option<String>,
}

async fn fetch_detail(
    fetcher: &HttpFetcher,
    param_list: &str,
    referer: &str,
) -> Result<ResolvedUrls, CoreError> {
    let is_outer = referer.contains("isOuterPageReq=true");
    let endpoint = if is_outer { DETAIL_OUTER_URL } else { DETAIL_SHOW_URL };

    let form = [
        ("paramList", param_list),
        ("code", ""),
        ("aliView", "0"),
        ("invoiceDetailMiddleUri", "/scan-invoice/printQrcode"),
        ("shortLinkSource", "email"),
    ];

    let body = fetcher
        .post_form(endpoint, &form, UserAgentMode::ChromeBrowser, referer, PORTAL_HOST)
        .await?;

    let parsed: DetailResponse = serde_json::from_slice(&body)
        .map_err(|e| CoreError::provider_resolve_failed(format!("bad nuonuo detail json: {e}")))?;

    if parsed.status != "0000" {
        return Err(CoreError::provider_resolve_failed(format!(
            "nuonuo detail status {}",
            parsed.status
        )));
    }

    let vo = parsed
        .data
        .and_then(|d| d.invoice_simple_vo)
        .ok_or_else(|| CoreError::provider_resolve_failed("nuonuo detail missing invoiceSimpleVo"))?;

    Ok(ResolvedUrls { pdf_url: vo.url, xml_url: vo.xml_url })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_short_and_portal_links() {
        assert!(is_short_link("https://nnfp.jss.com.cn/8_CszRwjaw-FBnv"));
        assert!(is_short_link("https://of1.cn/abcdef"));
        assert!(is_portal_link("https://fp.nuonuo.com/#/scan-invoice/printQrcode?paramList=XYZ"));
    }

    #[test]
    fn extracts_param_list_from_fragment_query() {
        let url = "https://fp.nuonuo.com/#/scan-invoice/printQrcode?paramList=XYZ&aliView=0";
        assert_eq!(portal_param_list(url).unwrap(), "XYZ");
    }

    #[test]
    fn extracts_param_list_from_plain_query() {
        let url = "https://fp.nuonuo.com/scan-invoice/printQrcode?paramList=ABC";
        assert_eq!(extract_param_list(url).unwrap(), "ABC");
    }

    #[test]
    fn missing_param_list_is_an_error() {
        assert!(portal_param_list("https://fp.nuonuo.com/#/").is_err());
    }
}
