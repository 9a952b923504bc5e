//! WebDAV file store with conditional-write headers.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration};
use log::debug;
use reqwest::header::{HeaderValue, ETAG, IF_MATCH, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use std::time::Duration;

use daystack_core::sync::WebDavCredentials;

use crate::provider::{FileProviderError, FileStoreProvider, RemoteFile};

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Prefix marking a rev that came from `Last-Modified` instead of `ETag`.
const LAST_MODIFIED_REV_PREFIX: &str = "lm:";

/// Turn a captured rev into the precondition header for an upload.
///
/// `Last-Modified` revs get a one-second buffer: some servers store
/// sub-second mtimes but expose only second precision, so a same-second
/// rewrite would spuriously fail the precondition.
fn precondition_for(rev: &str) -> (&'static str, String) {
    if let Some(date) = rev.strip_prefix(LAST_MODIFIED_REV_PREFIX) {
        let buffered = DateTime::parse_from_rfc2822(date)
            .map(|parsed| (parsed + ChronoDuration::seconds(1)).to_rfc2822())
            .unwrap_or_else(|_| date.to_string());
        ("If-Unmodified-Since", buffered)
    } else {
        ("If-Match", rev.to_string())
    }
}

fn rev_from_headers(headers: &reqwest::header::HeaderMap) -> String {
    if let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok()) {
        return etag.to_string();
    }
    if let Some(modified) = headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()) {
        return format!("{}{}", LAST_MODIFIED_REV_PREFIX, modified);
    }
    String::new()
}

fn classify_status(status: StatusCode, path: &str) -> FileProviderError {
    match status.as_u16() {
        404 => FileProviderError::NotFound(path.to_string()),
        401 | 403 => FileProviderError::Auth(format!("HTTP {} for {}", status, path)),
        412 => FileProviderError::RevMismatch {
            expected: None,
            actual: None,
        },
        408 | 423 | 429 | 500..=599 => {
            FileProviderError::transient(format!("HTTP {} for {}", status, path))
        }
        _ => FileProviderError::Other(format!("HTTP {} for {}", status, path)),
    }
}

/// WebDAV-backed file store.
pub struct WebDavProvider {
    client: reqwest::Client,
    cfg: WebDavCredentials,
}

impl WebDavProvider {
    pub fn new(cfg: WebDavCredentials) -> Result<Self, FileProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FileProviderError::Other(format!("client build failed: {}", e)))?;
        Ok(Self { client, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
    }

    /// Fetch the current validator of a file (used when a PUT response
    /// carries none).
    async fn head_rev(&self, path: &str) -> Result<String, FileProviderError> {
        let response = self
            .request(Method::HEAD, path)
            .send()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), path));
        }
        Ok(rev_from_headers(response.headers()))
    }
}

#[async_trait]
impl FileStoreProvider for WebDavProvider {
    async fn is_ready(&self) -> bool {
        !self.cfg.base_url.trim().is_empty() && !self.cfg.username.trim().is_empty()
    }

    async fn download_file(&self, path: &str) -> Result<RemoteFile, FileProviderError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), path));
        }
        let rev = rev_from_headers(response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?
            .to_vec();
        Ok(RemoteFile { rev, data })
    }

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        expected_rev: Option<&str>,
        force_overwrite: bool,
    ) -> Result<String, FileProviderError> {
        let mut request = self.request(Method::PUT, path).body(data.to_vec());
        if !force_overwrite {
            match expected_rev {
                Some(rev) => {
                    let (header, value) = precondition_for(rev);
                    let value = HeaderValue::from_str(&value).map_err(|_| {
                        FileProviderError::Other(format!("invalid rev header: {}", value))
                    })?;
                    request = request.header(header, value);
                }
                None => {
                    request = request.header(IF_NONE_MATCH, HeaderValue::from_static("*"));
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), path));
        }

        let rev = rev_from_headers(response.headers());
        if !rev.is_empty() {
            return Ok(rev);
        }
        debug!("[FileSync] PUT response carried no validator, HEAD follows");
        self.head_rev(path).await
    }

    async fn remove(
        &self,
        path: &str,
        expected_rev: Option<&str>,
    ) -> Result<(), FileProviderError> {
        let mut request = self.request(Method::DELETE, path);
        if let Some(rev) = expected_rev {
            if !rev.starts_with(LAST_MODIFIED_REV_PREFIX) {
                request = request.header(
                    IF_MATCH,
                    HeaderValue::from_str(rev).map_err(|_| {
                        FileProviderError::Other(format!("invalid rev header: {}", rev))
                    })?,
                );
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), path));
        }
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>, FileProviderError> {
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|_| FileProviderError::Other("PROPFIND unsupported".to_string()))?;
        let response = self
            .request(method, path)
            .header("Depth", HeaderValue::from_static("1"))
            .send()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), path));
        }
        let body = response
            .text()
            .await
            .map_err(|e| FileProviderError::transient(e.to_string()))?;
        Ok(parse_propfind_hrefs(&body))
    }

    async fn create_dir(&self, path: &str) -> Result<(), FileProviderError> {
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|_| FileProviderError::Other("MKCOL unsupported".to_string()))?;

        // Create each missing ancestor in order.
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            let response = self
                .request(method.clone(), &prefix)
                .send()
                .await
                .map_err(|e| FileProviderError::transient(e.to_string()))?;
            // 405 = collection already exists.
            if !response.status().is_success() && response.status().as_u16() != 405 {
                return Err(classify_status(response.status(), &prefix));
            }
        }
        Ok(())
    }
}

/// Pull `<d:href>` values out of a PROPFIND response without a full XML
/// parser.
fn parse_propfind_hrefs(body: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let lowered = body.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(open_rel) = lowered[search_from..].find(":href>") {
        let start = search_from + open_rel + ":href>".len();
        let Some(close_rel) = lowered[start..].find("</") else {
            break;
        };
        let value = body[start..start + close_rel].trim();
        if !value.is_empty() && !value.ends_with('/') {
            hrefs.push(value.to_string());
        }
        search_from = start + close_rel;
    }
    hrefs
}
