//! HTTP byte retrieval.

use std::io::Read;
use std::time::Duration;

use crate::error::FetchError;

/// Largest body accepted for one image.
const MAX_BODY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetch capability. Non-2xx statuses are returned, not raised, so the
/// caller can inspect them; only transport failures are errors.
pub trait HttpFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

pub struct UreqFetcher {
    agent: ureq::Agent,
}

impl UreqFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self { agent }
    }
}

fn read_response(response: ureq::Response) -> Result<HttpResponse, FetchError> {
    let status = response.status();
    let content_type = response.header("content-type").map(str::to_string);
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Network(e.to_string()))?;
    Ok(HttpResponse {
        status,
        content_type,
        body,
    })
}

impl HttpFetcher for UreqFetcher {
    fn fetch(&self, url: &str) -> Result<HttpResponse, FetchError> {
        match self.agent.get(url).call() {
            Ok(response) => read_response(response),
            Err(ureq::Error::Status(_, response)) => read_response(response),
            Err(ureq::Error::Transport(t)) => Err(FetchError::Network(t.to_string())),
        }
    }
}
