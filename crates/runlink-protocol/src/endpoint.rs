//! Endpoint construction for the backend's three run surfaces.

use url::Url;

use crate::error::{LinkError, LinkResult};
use crate::ids::RunIdentity;

/// Stream mode requested from the unidirectional endpoint unless configured.
pub const DEFAULT_STREAM_MODE: &str = "messages,values,updates";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// `base` must be an `http` or `https` URL; a path prefix (e.g. `/api`) is kept.
    pub fn new(base: Url) -> LinkResult<Self> {
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(LinkError::InvalidEndpoint(format!(
                    "unsupported scheme {other}, expected http or https"
                )));
            }
        }
        if base.cannot_be_a_base() {
            return Err(LinkError::InvalidEndpoint(format!(
                "{base} cannot be used as a base url"
            )));
        }
        Ok(Self { base })
    }

    pub fn parse(base: &str) -> LinkResult<Self> {
        Self::new(Url::parse(base)?)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `{ws}/threads/{thread}/runs/{run}/ws?token=...`
    pub fn duplex(&self, identity: &RunIdentity, credential: &str) -> LinkResult<Url> {
        let mut url = self.join(&[
            "threads",
            identity.thread_id.as_str(),
            "runs",
            identity.run_id.as_str(),
            "ws",
        ])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| LinkError::InvalidEndpoint(format!("cannot use {scheme} for {url}")))?;
        url.query_pairs_mut().append_pair("token", credential);
        Ok(url)
    }

    /// `{base}/threads/{thread}/stream?run_id=...&stream_mode=...`
    pub fn stream(&self, identity: &RunIdentity, stream_mode: &str) -> LinkResult<Url> {
        let mut url = self.join(&["threads", identity.thread_id.as_str(), "stream"])?;
        url.query_pairs_mut()
            .append_pair("run_id", identity.run_id.as_str())
            .append_pair("stream_mode", stream_mode);
        Ok(url)
    }

    /// `{base}/threads/{thread}/runs/{run}`
    pub fn snapshot(&self, identity: &RunIdentity) -> LinkResult<Url> {
        self.join(&[
            "threads",
            identity.thread_id.as_str(),
            "runs",
            identity.run_id.as_str(),
        ])
    }

    fn join(&self, segments: &[&str]) -> LinkResult<Url> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| LinkError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}
