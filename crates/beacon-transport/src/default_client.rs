// ABOUTME: reqwest-backed HttpClient running each call as a cancellable tokio task.
// ABOUTME: Enforces https, gzips large bodies, bounds concurrency, and classifies responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use http::Method;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::compression::{gzip, should_compress};
use crate::error::TransportError;
use crate::http::{
    CONTENT_ENCODING, CONTENT_TYPE, CallTemplate, ETAG, HttpClient, HttpResponse, ServiceCall,
    ServiceCallback,
};
use crate::redact::{loggable_body, redact_headers};

pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 16;

/// Builder for [`DefaultHttpClient`].
#[derive(Debug, Clone)]
pub struct DefaultHttpClientBuilder {
    compression: bool,
    https_only: bool,
    max_concurrent_calls: usize,
    connect_timeout: Duration,
    timeout: Duration,
}

impl Default for DefaultHttpClientBuilder {
    fn default() -> Self {
        Self {
            compression: true,
            https_only: true,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl DefaultHttpClientBuilder {
    /// Gzip request bodies of at least 1400 bytes (on by default).
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Refuse any url whose scheme is not `https` (on by default).
    pub fn https_only(mut self, https_only: bool) -> Self {
        self.https_only = https_only;
        self
    }

    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<DefaultHttpClient, TransportError> {
        let client = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(DefaultHttpClient {
            inner: Arc::new(ClientInner {
                client,
                compression: self.compression,
                https_only: self.https_only,
                permits: Arc::new(Semaphore::new(self.max_concurrent_calls)),
                registry: Mutex::new(CallRegistry::default()),
            }),
        })
    }
}

#[derive(Debug, Default)]
struct CallRegistry {
    closed: bool,
    next_id: u64,
    calls: HashMap<u64, CancellationToken>,
}

struct ClientInner {
    client: reqwest::Client,
    compression: bool,
    https_only: bool,
    permits: Arc<Semaphore>,
    registry: Mutex<CallRegistry>,
}

/// The production HTTP client. Calls must be started from within a tokio runtime.
#[derive(Clone)]
pub struct DefaultHttpClient {
    inner: Arc<ClientInner>,
}

impl DefaultHttpClient {
    pub fn new() -> Result<Self, TransportError> {
        Self::builder().build()
    }

    pub fn builder() -> DefaultHttpClientBuilder {
        DefaultHttpClientBuilder::default()
    }

    /// Number of calls started and not yet finished or cancelled by `close`.
    pub fn tracked_calls(&self) -> usize {
        self.inner.registry().calls.len()
    }
}

impl HttpClient for DefaultHttpClient {
    fn call_async(
        &self,
        url: &str,
        method: Method,
        headers: HashMap<String, String>,
        template: Option<Box<dyn CallTemplate>>,
        callback: ServiceCallback,
    ) -> ServiceCall {
        let (id, token, permit) = match self.inner.register() {
            Ok(registration) => registration,
            Err(e) => {
                tracing::debug!(url = %url, "call refused: {}", e);
                // Delivered on the runtime, never on the caller's stack.
                tokio::spawn(async move { callback(Err(e)) });
                return ServiceCall::completed();
            }
        };

        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        let task_token = token.clone();
        tokio::spawn(async move {
            let outcome = inner
                .execute(&url, method, headers, template, &task_token)
                .await;
            inner.untrack(id);
            drop(permit);
            match outcome {
                Some(result) => callback(result),
                None => tracing::debug!(url = %url, "call cancelled, no outcome delivered"),
            }
        });

        ServiceCall::new(token)
    }

    fn close(&self) {
        let mut registry = self.inner.registry();
        registry.closed = true;
        let cancelled = registry.calls.len();
        for (_, token) in registry.calls.drain() {
            token.cancel();
        }
        tracing::debug!(cancelled, "http client closed");
    }

    fn reopen(&self) {
        self.inner.registry().closed = false;
    }
}

impl ClientInner {
    fn registry(&self) -> MutexGuard<'_, CallRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> Result<(u64, CancellationToken, OwnedSemaphorePermit), TransportError> {
        let mut registry = self.registry();
        if registry.closed {
            return Err(TransportError::Closed);
        }
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| TransportError::Rejected)?;

        registry.next_id += 1;
        let id = registry.next_id;
        let token = CancellationToken::new();
        registry.calls.insert(id, token.clone());
        Ok((id, token, permit))
    }

    fn untrack(&self, id: u64) {
        self.registry().calls.remove(&id);
    }

    /// Run one call. `None` means the call was cancelled before a
    /// deliverable outcome existed.
    async fn execute(
        &self,
        url: &str,
        method: Method,
        headers: HashMap<String, String>,
        template: Option<Box<dyn CallTemplate>>,
        token: &CancellationToken,
    ) -> Option<Result<HttpResponse, TransportError>> {
        if token.is_cancelled() {
            return None;
        }

        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return Some(Err(TransportError::InvalidUrl(format!("{}: {}", url, e)))),
        };
        if self.https_only && parsed.scheme() != "https" {
            return Some(Err(TransportError::InsecureUrl(url.to_string())));
        }

        let mut headers = headers;
        let carries_body = method == Method::POST || method == Method::PUT || method == Method::PATCH;
        let body = match &template {
            Some(template) => {
                template.on_before_calling(url, &headers);
                if carries_body {
                    match template.build_request_body() {
                        Ok(body) => Some(body),
                        Err(e) => return Some(Err(e)),
                    }
                } else {
                    None
                }
            }
            None => None,
        };

        let mut payload = None;
        if let Some(body) = body {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE)) {
                headers.insert(CONTENT_TYPE.to_string(), "application/json".to_string());
            }
            if tracing::enabled!(tracing::Level::TRACE) {
                let content_type = header_value(&headers, CONTENT_TYPE);
                tracing::trace!("request body:\n{}", loggable_body(&body, content_type));
            }

            let mut bytes = body.into_bytes();
            if should_compress(&bytes, self.compression) {
                bytes = match gzip(&bytes) {
                    Ok(compressed) => compressed,
                    Err(e) => return Some(Err(TransportError::Serialization(e.to_string()))),
                };
                headers.insert(CONTENT_ENCODING.to_string(), "gzip".to_string());
            }
            payload = Some(bytes);
        }

        tracing::debug!(method = %method, url = %url, "calling");
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(headers = ?redact_headers(&headers), "request headers");
        }

        let mut request = self.client.request(method, parsed);
        for (key, value) in &headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(bytes) = payload {
            request = request.body(bytes);
        }

        if token.is_cancelled() {
            return None;
        }

        let sent = tokio::select! {
            _ = token.cancelled() => return None,
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(_) if token.is_cancelled() => return None,
            Err(e) => return Some(Err(classify(e))),
        };

        let status = response.status().as_u16();
        let success = (200..300).contains(&status);
        if success && token.is_cancelled() {
            return None;
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Once a failure status is known it is delivered even if cancelled.
        let text = if success {
            tokio::select! {
                _ = token.cancelled() => return None,
                text = response.text() => text,
            }
        } else {
            response.text().await
        };
        let payload = match text {
            Ok(payload) => payload,
            Err(_) if token.is_cancelled() => return None,
            Err(e) => return Some(Err(classify(e))),
        };

        tracing::debug!(url = %url, status, "call finished");
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                "response body:\n{}",
                loggable_body(&payload, content_type.as_deref())
            );
        }

        if !success {
            return Some(Err(TransportError::Http { status, payload }));
        }
        if token.is_cancelled() {
            return None;
        }

        let mut response_headers = HashMap::new();
        if let Some(etag) = etag {
            response_headers.insert(ETAG.to_string(), etag);
        }
        Some(Ok(HttpResponse {
            status,
            payload,
            headers: response_headers,
        }))
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{any, get};
    use tokio::sync::oneshot;

    type Seen = Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>;

    async fn record(State(seen): State<Seen>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
        seen.lock().unwrap().push((headers, body.to_vec()));
        ([("ETag", "\"v1\""), ("X-Other", "dropped")], "OK")
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn serve(seen: Seen) -> String {
        let router = Router::new()
            .route("/record", any(record))
            .route("/slow", get(slow))
            .route("/busy", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "Busy") }))
            .route("/unchanged", get(|| async { StatusCode::NOT_MODIFIED }))
            .route("/created", get(|| async { (StatusCode::CREATED, "made") }))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn plain_client() -> DefaultHttpClient {
        DefaultHttpClient::builder().https_only(false).build().unwrap()
    }

    struct Template {
        body: Result<String, TransportError>,
        built: Arc<AtomicBool>,
        before: Arc<AtomicBool>,
    }

    impl Template {
        fn boxed(body: Result<String, TransportError>) -> (Box<dyn CallTemplate>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let built = Arc::new(AtomicBool::new(false));
            let before = Arc::new(AtomicBool::new(false));
            let template = Template {
                body,
                built: Arc::clone(&built),
                before: Arc::clone(&before),
            };
            (Box::new(template), built, before)
        }
    }

    impl CallTemplate for Template {
        fn build_request_body(&self) -> Result<String, TransportError> {
            self.built.store(true, Ordering::SeqCst);
            self.body.clone()
        }

        fn on_before_calling(&self, _url: &str, _headers: &HashMap<String, String>) {
            self.before.store(true, Ordering::SeqCst);
        }
    }

    fn start(
        client: &DefaultHttpClient,
        url: &str,
        method: Method,
        headers: HashMap<String, String>,
        template: Option<Box<dyn CallTemplate>>,
    ) -> (ServiceCall, oneshot::Receiver<Result<HttpResponse, TransportError>>) {
        let (tx, rx) = oneshot::channel();
        let call = client.call_async(
            url,
            method,
            headers,
            template,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        (call, rx)
    }

    async fn call(
        client: &DefaultHttpClient,
        url: &str,
        method: Method,
        headers: HashMap<String, String>,
        template: Option<Box<dyn CallTemplate>>,
    ) -> Result<HttpResponse, TransportError> {
        let (_call, rx) = start(client, url, method, headers, template);
        rx.await.expect("callback should be invoked")
    }

    fn secret_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("App-Secret".to_string(), "secret-value".to_string());
        headers
    }

    #[tokio::test]
    async fn post_sends_json_body_and_keeps_only_etag() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;
        let (template, built, before) = Template::boxed(Ok("{\"logs\":[]}".to_string()));

        let response = call(
            &plain_client(),
            &format!("{}/record", base),
            Method::POST,
            secret_headers(),
            Some(template),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.payload, "OK");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.etag(), Some("\"v1\""));
        assert!(built.load(Ordering::SeqCst));
        assert!(before.load(Ordering::SeqCst));

        let seen = seen.lock().unwrap();
        let (headers, body) = &seen[0];
        assert_eq!(headers["content-type"], "application/json");
        assert!(headers.get("content-encoding").is_none());
        assert_eq!(headers["app-secret"], "secret-value");
        assert_eq!(body.as_slice(), b"{\"logs\":[]}");
    }

    #[tokio::test]
    async fn large_body_is_gzipped_and_caller_content_type_kept() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;
        let payload = "x".repeat(2000);
        let (template, _, _) = Template::boxed(Ok(payload.clone()));
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "custom".to_string());

        call(&plain_client(), &format!("{}/record", base), Method::POST, headers, Some(template))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let (headers, body) = &seen[0];
        assert_eq!(headers["content-type"], "custom");
        assert_eq!(headers["content-encoding"], "gzip");
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(body.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn compression_can_be_disabled() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;
        let client = DefaultHttpClient::builder()
            .https_only(false)
            .compression(false)
            .build()
            .unwrap();
        let (template, _, _) = Template::boxed(Ok("y".repeat(5000)));

        call(&client, &format!("{}/record", base), Method::POST, HashMap::new(), Some(template))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[0].0.get("content-encoding").is_none());
        assert_eq!(seen[0].1.len(), 5000);
    }

    #[tokio::test]
    async fn get_sends_no_body_and_skips_body_builder() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;
        let (template, built, before) = Template::boxed(Ok("unused".to_string()));

        let response = call(&plain_client(), &format!("{}/record", base), Method::GET, secret_headers(), Some(template))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(before.load(Ordering::SeqCst));
        assert!(!built.load(Ordering::SeqCst));
        let seen = seen.lock().unwrap();
        assert!(seen[0].0.get("content-type").is_none());
        assert!(seen[0].1.is_empty());
    }

    #[tokio::test]
    async fn post_without_template_has_no_content_headers() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;

        call(&plain_client(), &format!("{}/record", base), Method::POST, secret_headers(), None)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[0].0.get("content-type").is_none());
        assert!(seen[0].0.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn other_2xx_statuses_succeed() {
        let base = serve(Seen::default()).await;
        let response = call(&plain_client(), &format!("{}/created", base), Method::GET, HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.payload, "made");
    }

    #[tokio::test]
    async fn error_status_carries_payload() {
        let base = serve(Seen::default()).await;
        let err = call(&plain_client(), &format!("{}/busy", base), Method::GET, HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Http {
                status: 503,
                payload: "Busy".to_string()
            }
        );
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn redirect_class_status_is_a_failure() {
        let base = serve(Seen::default()).await;
        let err = call(&plain_client(), &format!("{}/unchanged", base), Method::GET, HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(304));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn plain_http_is_refused_before_touching_template() {
        let (template, built, before) = Template::boxed(Ok("{}".to_string()));
        let client = DefaultHttpClient::new().unwrap();

        let err = call(&client, "http://127.0.0.1:9/logs", Method::POST, HashMap::new(), Some(template))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::InsecureUrl(_)), "got {:?}", err);
        assert!(!built.load(Ordering::SeqCst));
        assert!(!before.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn malformed_url_is_invalid() {
        let err = call(&plain_client(), "not a url", Method::GET, HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn body_builder_failure_is_reported_without_sending() {
        let seen = Seen::default();
        let base = serve(Arc::clone(&seen)).await;
        let (template, _, _) = Template::boxed(Err(TransportError::Serialization("bad".to_string())));

        let err = call(&plain_client(), &format!("{}/record", base), Method::POST, HashMap::new(), Some(template))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::Serialization("bad".to_string()));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connection_is_recoverable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = call(&plain_client(), &format!("http://{}/logs", addr), Method::GET, HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)), "got {:?}", err);
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn cancelled_call_never_invokes_callback() {
        let base = serve(Seen::default()).await;
        let client = plain_client();

        let (call, rx) = start(&client, &format!("{}/slow", base), Method::GET, HashMap::new(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.tracked_calls(), 1);
        call.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await;
        assert!(
            matches!(outcome, Ok(Err(_))),
            "callback must be dropped without being called"
        );
        assert_eq!(client.tracked_calls(), 0);
    }

    #[tokio::test]
    async fn close_cancels_outstanding_calls_until_reopen() {
        let base = serve(Seen::default()).await;
        let client = plain_client();

        let (_slow, slow_rx) = start(&client, &format!("{}/slow", base), Method::GET, HashMap::new(), None);
        assert_eq!(client.tracked_calls(), 1);

        client.close();
        assert_eq!(client.tracked_calls(), 0);
        let outcome = tokio::time::timeout(Duration::from_secs(2), slow_rx).await;
        assert!(matches!(outcome, Ok(Err(_))));

        let err = call(&client, &format!("{}/record", base), Method::GET, HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);

        client.reopen();
        let ok = call(&client, &format!("{}/record", base), Method::GET, HashMap::new(), None).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn saturated_client_rejects_asynchronously() {
        let base = serve(Seen::default()).await;
        let client = DefaultHttpClient::builder()
            .https_only(false)
            .max_concurrent_calls(1)
            .build()
            .unwrap();

        let (slow, _slow_rx) = start(&client, &format!("{}/slow", base), Method::GET, HashMap::new(), None);

        let delivered_inline = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered_inline);
        let (tx, rx) = oneshot::channel();
        client.call_async(
            &format!("{}/record", base),
            Method::GET,
            HashMap::new(),
            None,
            Box::new(move |result| {
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(result);
            }),
        );
        assert!(!delivered_inline.load(Ordering::SeqCst), "rejection must not run on the caller's stack");

        assert_eq!(rx.await.unwrap().unwrap_err(), TransportError::Rejected);
        slow.cancel();
    }
}
