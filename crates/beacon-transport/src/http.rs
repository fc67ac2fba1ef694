// ABOUTME: Asynchronous HTTP call abstraction: HttpClient trait, call templates, and cancellable ServiceCall handles.
// ABOUTME: Callers never block; the outcome arrives once through a ServiceCallback.

use std::collections::HashMap;

use http::Method;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const ETAG: &str = "ETag";

/// A successful (2xx) response. Only the `ETag` response header is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub payload: String,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn new(status: u16, payload: impl Into<String>) -> Self {
        Self {
            status,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).map(String::as_str)
    }
}

/// Invoked at most once with the terminal outcome of a call.
pub type ServiceCallback = Box<dyn FnOnce(Result<HttpResponse, TransportError>) + Send + 'static>;

/// Hooks supplying the request body and observing the call just before it starts.
pub trait CallTemplate: Send + Sync {
    /// Build the request body. Only called for methods that carry one.
    fn build_request_body(&self) -> Result<String, TransportError>;

    fn on_before_calling(&self, _url: &str, _headers: &HashMap<String, String>) {}
}

/// Handle to an in-flight call.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    token: CancellationToken,
}

impl ServiceCall {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A call that is already finished and cannot be cancelled meaningfully.
    pub fn completed() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self { token }
    }

    /// Request cancellation. A call cancelled before its outcome is known
    /// never invokes its callback.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// An HTTP client performing calls in the background.
pub trait HttpClient: Send + Sync {
    fn call_async(
        &self,
        url: &str,
        method: Method,
        headers: HashMap<String, String>,
        template: Option<Box<dyn CallTemplate>>,
        callback: ServiceCallback,
    ) -> ServiceCall;

    /// Cancel every outstanding call and refuse new ones until `reopen`.
    fn close(&self);

    fn reopen(&self);
}
