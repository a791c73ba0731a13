use crate::error::{classify_reqwest, DownloadError};
use crate::options::DownloadOptions;
use reqwest::Client;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Maximum redirects followed before the probe gives up with `RedirectLoop`.
const MAX_REDIRECTS: usize = 10;

/// What the prober learned about the resource.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub total_size: u64,
    pub supports_ranges: bool,
    /// Final URL after redirects; later range requests go straight here.
    pub resolved_url: String,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// Build the shared HTTP client for a download.
pub fn build_client(options: &DownloadOptions) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .connect_timeout(options.connect_timeout())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .tcp_nodelay(true)
        .user_agent(DEFAULT_USER_AGENT);

    if let Some(proxy) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| DownloadError::SourceInvalid(format!("bad proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| DownloadError::Unreachable(e.to_string()))
}

/// Discover total size, range capability, and the resolved URL.
///
/// Issues a HEAD first; servers that reject HEAD get a `GET` with
/// `Range: bytes=0-0`, which also reveals range support via the 206
/// answer.
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult, DownloadError> {
    url::Url::parse(url).map_err(|e| DownloadError::SourceInvalid(format!("{url}: {e}")))?;

    let head = client.head(url).send().await.map_err(|e| classify_reqwest(&e))?;

    let response = if head.status().is_success() {
        head
    } else {
        client
            .get(url)
            .header("Range", "bytes=0-0")
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::BadStatus(status.as_u16()));
    }

    let resolved_url = response.url().to_string();
    let headers = response.headers();

    let total_size = if status == reqwest::StatusCode::PARTIAL_CONTENT {
        parse_content_range_total(
            headers
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
        )
        .unwrap_or(0)
    } else {
        headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    };

    let supports_ranges = headers
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
        || status == reqwest::StatusCode::PARTIAL_CONTENT
        || headers.contains_key(reqwest::header::CONTENT_RANGE);

    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let file_name = Some(extract_filename(&resolved_url, headers));

    Ok(ProbeResult {
        total_size,
        supports_ranges,
        resolved_url,
        content_type,
        file_name,
    })
}

/// Parse the TOTAL out of `Content-Range: bytes a-b/TOTAL`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

/// Extract a probable filename from the `Content-Disposition` header or the
/// URL path.
pub fn extract_filename(url: &str, headers: &reqwest::header::HeaderMap) -> String {
    if let Some(cd) = headers.get(reqwest::header::CONTENT_DISPOSITION) {
        if let Ok(cd_str) = cd.to_str() {
            // RFC 6266 filename*= (charset'lang'encoded-name)
            if let Some(pos) = cd_str.find("filename*=") {
                let part = cd_str[pos + 10..].split(';').next().unwrap_or("").trim();
                if let Some(quote) = part.rfind('\'') {
                    let encoded = &part[quote + 1..];
                    if let Ok(decoded) =
                        percent_encoding::percent_decode(encoded.as_bytes()).decode_utf8()
                    {
                        return sanitize_filename(&decoded);
                    }
                }
            }
            if let Some(pos) = cd_str.find("filename=") {
                let raw = cd_str[pos + 9..].split(';').next().unwrap_or("").trim();
                let raw = raw.trim_matches('"').trim_matches('\'');
                if !raw.is_empty() {
                    if let Ok(decoded) =
                        percent_encoding::percent_decode(raw.as_bytes()).decode_utf8()
                    {
                        return sanitize_filename(&decoded);
                    }
                    return sanitize_filename(raw);
                }
            }
        }
    }

    // Fall back to the last non-empty path segment before query/fragment.
    let filename = url
        .split('?')
        .next()
        .unwrap_or(url)
        .split('#')
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .find(|s| !s.is_empty())
        .map(|s| {
            percent_encoding::percent_decode(s.as_bytes())
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .unwrap_or_else(|| "download".to_string());

    sanitize_filename(&filename)
}

fn sanitize_filename(name: &str) -> String {
    let sanitized = name.replace(|c: char| c.is_control() || "<>:\"/\\|?*".contains(c), "_");
    if sanitized.is_empty() {
        "download".to_string()
    } else {
        sanitized
    }
}
