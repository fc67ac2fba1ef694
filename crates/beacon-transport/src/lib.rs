// ABOUTME: Transport layer for beacon: asynchronous HTTP calls and the ingestion endpoint client.
// ABOUTME: Provides the reqwest-backed DefaultHttpClient, response classification, and IngestionHttp.

pub mod compression;
pub mod default_client;
pub mod error;
pub mod http;
pub mod ingestion;
pub mod redact;

pub use default_client::{DefaultHttpClient, DefaultHttpClientBuilder};
pub use error::{TransportError, is_recoverable_status};
pub use http::{CallTemplate, HttpClient, HttpResponse, ServiceCall, ServiceCallback};
pub use ingestion::{DEFAULT_LOG_URL, Ingestion, IngestionHttp};
