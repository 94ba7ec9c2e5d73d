//! HTTP request handling on top of the response cache.
//!
//! The runtime hands every complete request to a [`Service`]. The default
//! service serves static resources through the cache, routes auth verdicts
//! and forwards JSON statements to the query executor.

mod get;
pub mod mime;
mod post;
pub mod request;
pub mod response;

pub use request::{Method, ParseResult, Request};
pub use response::Response;

use crate::cache::Cache;
use crate::services::auth::{AuthVerdict, Authenticator};
use crate::services::query::QueryExecutor;
use std::sync::Arc;
use tracing::debug;

/// Turns a request into a response. Runs on pool workers.
pub trait Service: Send + Sync {
    fn respond(&self, request: &Request) -> Response;
}

pub const MSG_NOT_LOGGED_IN: &str = "You haven't logged in!";
pub const MSG_TOKEN_EXPIRED: &str = "Token expired, please relogin!";
pub const MSG_TOKEN_INVALID: &str = "Illegal, please verify yourself!";

pub struct HttpService {
    cache: Arc<Cache>,
    auth: Option<Arc<dyn Authenticator>>,
    public_paths: Vec<String>,
    query: Option<Arc<dyn QueryExecutor>>,
}

impl HttpService {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            auth: None,
            public_paths: Vec::new(),
            query: None,
        }
    }

    /// Require a valid token for every path outside `public_paths`.
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>, public_paths: Vec<String>) -> Self {
        self.auth = Some(auth);
        self.public_paths = public_paths;
        self
    }

    pub fn with_query(mut self, query: Arc<dyn QueryExecutor>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    fn authorize(&self, request: &Request) -> Result<(), Response> {
        let Some(auth) = &self.auth else {
            return Ok(());
        };
        if self.public_paths.iter().any(|p| *p == request.path) {
            return Ok(());
        }

        let Some(token) = request.bearer_token() else {
            debug!(path = %request.path, "Unauthenticated request");
            return Err(Response::page(401, MSG_NOT_LOGGED_IN));
        };
        match auth.verify(token) {
            AuthVerdict::Passed => Ok(()),
            AuthVerdict::Expired => Err(Response::page(401, MSG_TOKEN_EXPIRED)),
            AuthVerdict::Invalid => Err(Response::page(401, MSG_TOKEN_INVALID)),
        }
    }
}

impl Service for HttpService {
    fn respond(&self, request: &Request) -> Response {
        if let Err(denied) = self.authorize(request) {
            return denied;
        }

        match request.method {
            Method::Get | Method::Head => get::serve(self, request),
            Method::Post => post::serve(self, request),
            Method::Other(ref method) => {
                debug!(method = %method, "Unsupported method");
                Response::error(405).header("Allow", "GET, HEAD, POST")
            }
        }
    }
}
