//! Network access behind a small trait so stages can be driven without a live origin.

use futures_util::StreamExt;
use reqwest::Client;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::artifact::ArtifactError;
use crate::html::HtmlError;

/// Anything that can turn a URL into a document body.
pub trait PageSource: Send + Sync + 'static {
    /// Retrieves the body of `url`.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// reqwest-backed [`PageSource`].
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Builds a client with the given user agent and request timeout.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl PageSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::http(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| FetchError::http(url, err))?;
            body.extend_from_slice(&chunk);
        }
        Ok(decode_body(body))
    }
}

fn decode_body(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Errors surfaced while fetching or storing a page.
#[derive(Debug)]
pub enum FetchError {
    /// Transport-level failure.
    Http {
        /// Requested URL.
        url: String,
        /// reqwest error.
        source: reqwest::Error,
    },
    /// The origin answered with a non-success status.
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// No answer within the configured timeout.
    Timeout {
        /// Requested URL.
        url: String,
        /// Timeout that elapsed.
        after: Duration,
    },
    /// The page arrived but its markup could not be read.
    Html {
        /// Requested URL.
        url: String,
        /// Markup error.
        source: HtmlError,
    },
    /// Persisting the page or the checkpoint failed.
    Artifact(ArtifactError),
    /// A fetch task panicked or was cancelled.
    Worker(tokio::task::JoinError),
}

impl FetchError {
    fn http(url: &str, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.to_string(),
            source,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { url, source } => write!(f, "request to {url} failed: {source}"),
            Self::Status { url, status } => write!(f, "{url} answered with status {status}"),
            Self::Timeout { url, after } => {
                write!(f, "{url} timed out after {:.1}s", after.as_secs_f32())
            }
            Self::Html { url, source } => write!(f, "unreadable markup at {url}: {source}"),
            Self::Artifact(err) => write!(f, "{err}"),
            Self::Worker(err) => write!(f, "fetch worker aborted: {err}"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Http { source, .. } => Some(source),
            Self::Html { source, .. } => Some(source),
            Self::Artifact(err) => Some(err),
            Self::Worker(err) => Some(err),
            Self::Status { .. } | Self::Timeout { .. } => None,
        }
    }
}

impl From<ArtifactError> for FetchError {
    fn from(err: ArtifactError) -> Self {
        Self::Artifact(err)
    }
}
