//! Request rewriting for the remote cluster gateway.
//!
//! The remote cluster is reached through a gateway that expects an extra
//! path segment in front of the usual API paths. Setting an API path on
//! the client config does not survive, because the dynamic client
//! overwrites it when building request paths, so the prefix is applied as
//! a tower layer on the client's service stack instead: every outbound
//! request that does not already carry the prefix is rewritten, and
//! absolute URIs are pinned to https so no upgrade roundtrip is needed.

use http::uri::{Parts, PathAndQuery, Scheme, Uri};
use http::Request;
use tower::{Layer, Service};
use tracing::warn;

/// Path prefix the remote cluster gateway expects on every request.
pub const REMOTE_API_PREFIX: &str = "/apis/core.kubernetes";

/// Layer that rewrites request URIs with [`PrefixUri`].
#[derive(Clone)]
pub struct PrefixUriLayer {
    prefix: &'static str,
}

impl PrefixUriLayer {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl<S> Layer<S> for PrefixUriLayer {
    type Service = PrefixUri<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PrefixUri {
            inner,
            prefix: self.prefix,
        }
    }
}

/// Service wrapper that prepends a path prefix to outbound requests.
#[derive(Clone)]
pub struct PrefixUri<S> {
    inner: S,
    prefix: &'static str,
}

impl<S, B> Service<Request<B>> for PrefixUri<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        match prefixed_uri(req.uri(), self.prefix) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                // Leave the request alone; the server will reject it with
                // a clear 404 rather than us guessing at a URI.
                warn!(uri = %req.uri(), error = %e, "failed to rewrite request URI");
            }
        }
        self.inner.call(req)
    }
}

/// Compute the rewritten URI: path gains the prefix unless it already has
/// it, and the scheme of absolute URIs becomes https.
fn prefixed_uri(uri: &Uri, prefix: &str) -> Result<Uri, http::Error> {
    let path = uri.path();
    let needs_prefix = !path.starts_with(&format!("{prefix}/"));

    let mut parts = Parts::from(uri.clone());
    if parts.authority.is_some() {
        parts.scheme = Some(Scheme::HTTPS);
    }
    if needs_prefix {
        let path_and_query = match uri.query() {
            Some(query) => format!("{prefix}{path}?{query}"),
            None => format!("{prefix}{path}"),
        };
        parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>()?);
    }
    Ok(Uri::from_parts(parts)?)
}
