// ABOUTME: Channel-facing ingestion abstraction and its HTTP implementation.
// ABOUTME: IngestionHttp posts a LogContainer as JSON to {log_url}/logs with secret and install id headers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use beacon_core::LogContainer;
use http::Method;
use uuid::Uuid;

use crate::error::TransportError;
use crate::http::{CallTemplate, HttpClient, ServiceCall, ServiceCallback};
use crate::redact::hide_secret;

pub const DEFAULT_LOG_URL: &str = "https://in.appcenter.ms";
pub const LOG_PATH: &str = "/logs?api-version=1.0.0";
pub const APP_SECRET_HEADER: &str = "App-Secret";
pub const INSTALL_ID_HEADER: &str = "Install-ID";

/// Sends batches of records to an ingestion endpoint.
pub trait Ingestion: Send + Sync {
    fn send_async(
        &self,
        app_secret: Option<&str>,
        install_id: Uuid,
        logs: &LogContainer,
        callback: ServiceCallback,
    ) -> ServiceCall;

    fn set_log_url(&self, url: &str);

    /// Cancel outstanding sends and refuse new ones until `reopen`.
    fn close(&self);

    fn reopen(&self);
}

/// Serializes the container lazily, on the call task.
struct LogsTemplate {
    logs: LogContainer,
}

impl CallTemplate for LogsTemplate {
    fn build_request_body(&self) -> Result<String, TransportError> {
        serde_json::to_string(&self.logs).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    fn on_before_calling(&self, url: &str, headers: &HashMap<String, String>) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let secret = headers
                .get(APP_SECRET_HEADER)
                .map(|s| hide_secret(s))
                .unwrap_or_default();
            tracing::debug!(
                url = %url,
                app_secret = %secret,
                logs = self.logs.logs.len(),
                "sending logs"
            );
        }
    }
}

/// Ingestion over any [`HttpClient`].
pub struct IngestionHttp {
    client: Arc<dyn HttpClient>,
    log_url: RwLock<String>,
}

impl IngestionHttp {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self::with_log_url(client, DEFAULT_LOG_URL)
    }

    pub fn with_log_url(client: Arc<dyn HttpClient>, log_url: &str) -> Self {
        Self {
            client,
            log_url: RwLock::new(log_url.trim_end_matches('/').to_string()),
        }
    }

    pub fn log_url(&self) -> String {
        match self.log_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Ingestion for IngestionHttp {
    fn send_async(
        &self,
        app_secret: Option<&str>,
        install_id: Uuid,
        logs: &LogContainer,
        callback: ServiceCallback,
    ) -> ServiceCall {
        let mut headers = HashMap::new();
        if let Some(secret) = app_secret {
            headers.insert(APP_SECRET_HEADER.to_string(), secret.to_string());
        }
        headers.insert(INSTALL_ID_HEADER.to_string(), install_id.to_string());

        let url = format!("{}{}", self.log_url(), LOG_PATH);
        let template = LogsTemplate { logs: logs.clone() };
        self.client
            .call_async(&url, Method::POST, headers, Some(Box::new(template)), callback)
    }

    fn set_log_url(&self, url: &str) {
        let url = url.trim_end_matches('/').to_string();
        match self.log_url.write() {
            Ok(mut current) => *current = url,
            Err(poisoned) => *poisoned.into_inner() = url,
        }
    }

    fn close(&self) {
        self.client.close();
    }

    fn reopen(&self) {
        self.client.reopen();
    }
}
