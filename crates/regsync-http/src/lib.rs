//! regsync-http: the network edge of regsync.
//!
//! - [`Transport`]: authenticated JSON requests with bounded retry
//! - [`Paginator`]: complete, de-duplicated walks over paged listings
//! - [`EntitySummary`] / [`EntityDetail`]: list items and full records
//! - [`RunConfig`]: validated per-run settings

pub mod config;
pub mod endpoints;
pub mod entity;
pub mod error;
pub mod fakes;
pub mod paginate;
pub mod transport;

pub use config::{ApplyMode, RetryPolicy, RunConfig, RunConfigBuilder, DEFAULT_BASE_URL};
pub use entity::{CollectionField, EntityDetail, EntitySummary};
pub use error::{
    body_preview, ConfigError, LastFailure, NetworkError, NetworkErrorKind, PaginationError,
    TransportError,
};
pub use paginate::{Page, Paginator, StopReason, DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};
pub use transport::{
    http_transport, ApiRequest, ApiResponse, HttpBackend, RawResponse, ReqwestBackend,
    RetryingTransport, Transport, TransportStats, TransportStatsSnapshot,
};
