use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use tracing::debug;
use url::Url;

use crate::error::SourceError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote file-sharing API used for `remote` sources.
pub trait RemoteFetcher {
    fn fetch(&self, location: &str, credentials: Option<&str>) -> Result<Vec<u8>, SourceError>;

    /// Lightweight reachability check with a short timeout; never downloads
    /// the body.
    fn probe(&self, location: &str, credentials: Option<&str>) -> Result<(), SourceError>;
}

pub struct HttpFetcher {
    client: Client,
    probe_client: Client,
}

impl HttpFetcher {
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(FETCH_TIMEOUT).build()?,
            probe_client: Client::builder().timeout(PROBE_TIMEOUT).build()?,
        })
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, location: &str, credentials: Option<&str>) -> Result<Vec<u8>, SourceError> {
        let url = normalize_remote_url(location)?;
        debug!(url = %url, "fetching remote source");

        let response = with_credentials(self.client.get(url.clone()), credentials)
            .send()
            .map_err(|err| SourceError::Unreachable(format!("{url}: {err}")))?;
        check_status(response.status(), url.as_str())?;

        let bytes = response
            .bytes()
            .map_err(|err| SourceError::Unreachable(format!("{url}: {err}")))?;
        Ok(bytes.to_vec())
    }

    fn probe(&self, location: &str, credentials: Option<&str>) -> Result<(), SourceError> {
        let url = normalize_remote_url(location)?;
        let response = with_credentials(self.probe_client.head(url.clone()), credentials)
            .send()
            .map_err(|err| SourceError::Unreachable(format!("{url}: {err}")))?;

        // Some share hosts refuse HEAD but serve GET fine.
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        check_status(response.status(), url.as_str())
    }
}

fn with_credentials(request: RequestBuilder, credentials: Option<&str>) -> RequestBuilder {
    match credentials.map(str::trim).filter(|token| !token.is_empty()) {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<(), SourceError> {
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(SourceError::AuthFailed(format!("{url} answered {status}")))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(SourceError::NotFound(format!("{url} answered {status}")))
        }
        status => Err(SourceError::Unreachable(format!("{url} answered {status}"))),
    }
}

/// Parses a remote location and rewrites share links on dropbox hosts to
/// their direct-download form.
pub fn normalize_remote_url(location: &str) -> Result<Url, SourceError> {
    let mut url = Url::parse(location.trim())
        .map_err(|err| SourceError::Malformed(format!("invalid remote URL {location:?}: {err}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourceError::Malformed(format!(
            "remote URL must use http or https: {location}"
        )));
    }

    let is_share_host = url
        .host_str()
        .map(|host| host == "dropbox.com" || host.ends_with(".dropbox.com"))
        .unwrap_or(false);

    if is_share_host {
        let kept = url
            .query_pairs()
            .filter(|(key, _)| key != "dl")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("dl", "1");
    }

    Ok(url)
}
