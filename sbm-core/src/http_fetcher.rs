//! A single SSRF-guarded HTTP fetcher all external invoice-link fetches go
//! through. Grounded on the retry/backoff shape of `LexeApiClient`, adapted
//! to GET/HEAD byte-capped downloads instead of JSON RPCs.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use sbm_common::backoff;
use sbm_common::error::CoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_REDIRECTS: usize = 3;
const NUONUO_MAX_REDIRECTS: usize = 6;
const SERVICE_USER_AGENT: &str = "sbm-core/1.0";
const CHROME_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserAgentMode {
    Service,
    ChromeBrowser,
}

impl UserAgentMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Service => SERVICE_USER_AGENT,
            Self::ChromeBrowser => CHROME_USER_AGENT,
        }
    }

    fn max_redirects(self) -> usize {
        match self {
            Self::Service => DEFAULT_MAX_REDIRECTS,
            Self::ChromeBrowser => NUONUO_MAX_REDIRECTS,
        }
    }
}

/// The SSRF-guarded fetcher. One instance is shared across the process; its
/// semaphore bounds concurrent outbound downloads the way the teacher's
/// `ShutdownChannel` bounds shutdown fan-out, just for a different resource.
pub struct HttpFetcher {
    client: Client,
    download_permits: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(max_concurrent_downloads: usize) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            download_permits: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
        })
    }

    /// GET `url`, manually following redirects up to the mode's hop limit
    /// while re-applying the host guard at every hop, and returning the body
    /// capped at `max_bytes`.
    pub async fn get(
        &self,
        url: &str,
        mode: UserAgentMode,
        max_bytes: usize,
    ) -> Result<FetchedResponse, CoreError> {
        let _permit = self
            .download_permits
            .acquire()
            .await
            .map_err(|_| CoreError::remote_fetch_failed("download semaphore closed"))?;

        let mut current = parse_and_guard(url).await?;
        let mut backoff_iter = backoff::get_backoff_iter();
        let mut hops = 0;
        loop {
            let resp = self
                .client
                .get(current.clone())
                .header(reqwest::header::USER_AGENT, mode.as_str())
                .send()
                .await
                .map_err(|e| CoreError::remote_fetch_failed(format!("GET {current}: {e}")))?;

            if resp.status().is_redirection() {
                hops += 1;
                if hops > mode.max_redirects() {
                    return Err(CoreError::remote_fetch_failed(format!(
                        "too many redirects from {url}"
                    )));
                }
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        CoreError::remote_fetch_failed("redirect missing Location header")
                    })?;
                current = current
                    .join(location)
                    .map_err(|e| CoreError::remote_fetch_failed(format!("bad redirect: {e}")))?;
                guard_url(&current).await?;
                // A transient redirect hiccup backs off before the next hop.
                let _ = backoff_iter.next();
                continue;
            }

            if !resp.status().is_success() {
                return Err(CoreError::remote_fetch_failed(format!(
                    "{} returned {}",
                    current,
                    resp.status()
                )));
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let final_url = current.to_string();
            let body = read_capped(resp, max_bytes).await?;
            debug!(url = %final_url, bytes = body.len(), "fetched");
            return Ok(FetchedResponse { final_url, content_type, body });
        }
    }

    /// POST a form body with a `Referer`/`Origin` pair, as the NuoNuo detail
    /// endpoints require. Redirects are not expected here and are treated as
    /// failures.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        mode: UserAgentMode,
        referer: &str,
        origin_host: &str,
    ) -> Result<Vec<u8>, CoreError> {
        let _permit = self
            .download_permits
            .acquire()
            .await
            .map_err(|_| CoreError::remote_fetch_failed("download semaphore closed"))?;

        let target = parse_and_guard(url).await?;
        let origin = format!("https://{origin_host}");
        let resp = self
            .client
            .post(target.clone())
            .header(reqwest::header::USER_AGENT, mode.as_str())
            .header(reqwest::header::REFERER, referer)
            .header(reqwest::header::ORIGIN, origin)
            .form(form)
            .send()
            .await
            .map_err(|e| CoreError::remote_fetch_failed(format!("POST {target}: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::remote_fetch_failed(format!(
                "{} returned {}",
                target,
                resp.status()
            )));
        }
        read_capped(resp, 1024 * 1024).await
    }

    /// HEAD-follow: inspect `Location` manually without auto-following, used
    /// by the Baiwang short-link resolver.
    pub async fn head_follow(
        &self,
        url: &str,
        max_redirects: usize,
    ) -> Result<String, CoreError> {
        let _permit = self
            .download_permits
            .acquire()
            .await
            .map_err(|_| CoreError::remote_fetch_failed("download semaphore closed"))?;

        let mut current = parse_and_guard(url).await?;
        for _ in 0..=max_redirects {
            let resp = self
                .client
                .head(current.clone())
                .header(reqwest::header::USER_AGENT, UserAgentMode::Service.as_str())
                .send()
                .await
                .map_err(|e| CoreError::remote_fetch_failed(format!("HEAD {current}: {e}")))?;

            if resp.status() == StatusCode::OK {
                return Ok(current.to_string());
            }
            if !resp.status().is_redirection() {
                return Err(CoreError::remote_fetch_failed(format!(
                    "{} returned {}",
                    current,
                    resp.status()
                )));
            }
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| CoreError::remote_fetch_failed("redirect missing Location"))?;
            current = current
                .join(location)
                .map_err(|e| CoreError::remote_fetch_failed(format!("bad redirect: {e}")))?;
            guard_url(&current).await?;
        }
        Err(CoreError::remote_fetch_failed(format!(
            "too many redirects from {url}"
        )))
    }
}

pub struct FetchedResponse {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

async fn read_capped(resp: reqwest::Response, max_bytes: usize) -> Result<Vec<u8>, CoreError> {
    use futures::StreamExt;
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CoreError::remote_fetch_failed(format!("read body: {e}")))?;
        buf.extend_from_slice(&chunk);
        // The "+1 trick": one byte over the cap is an immediate, unambiguous
        // "payload too large", rather than silently truncating.
        if buf.len() > max_bytes {
            return Err(CoreError::remote_fetch_failed("payload too large"));
        }
    }
    Ok(buf)
}

async fn parse_and_guard(url: &str) -> Result<Url, CoreError> {
    let parsed = Url::parse(url)
        .map_err(|e| CoreError::remote_fetch_failed(format!("invalid url {url}: {e}")))?;
    guard_url(&parsed).await?;
    Ok(parsed)
}

/// The SSRF guard: only `http`/`https`, a non-empty non-`localhost` host, and
/// every `LookupIP` result (literal IPs resolve to themselves) clear of
/// loopback/link-local/ULA/private ranges. Resolving the hostname rather than
/// only checking literals closes a DNS-rebinding bypass: a public-looking
/// hostname that answers with a private address at request time.
async fn guard_url(url: &Url) -> Result<(), CoreError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CoreError::remote_fetch_failed(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| CoreError::remote_fetch_failed("url has no host"))?;
    if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        return Err(CoreError::remote_fetch_failed(format!("blocked host: {host}")));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            warn!(%host, "blocked SSRF attempt");
            return Err(CoreError::remote_fetch_failed(format!("blocked address: {host}")));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| CoreError::remote_fetch_failed(format!("dns lookup failed for {host}: {e}")))?;
    let mut any_resolved = false;
    for addr in resolved {
        any_resolved = true;
        if is_blocked_ip(addr.ip()) {
            warn!(%host, ip = %addr.ip(), "blocked SSRF attempt (DNS rebinding)");
            return Err(CoreError::remote_fetch_failed(format!(
                "blocked address for {host}: {}",
                addr.ip()
            )));
        }
    }
    if !any_resolved {
        return Err(CoreError::remote_fetch_failed(format!("no addresses resolved for {host}")));
    }
    Ok(())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7, unique local address range
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10, link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
