pub mod url;

pub use url::{
    CachedUrlPayload, ClickEvent, CreateUrlRequest, HealthResponse, HealthStatus, UrlRecord,
    UrlResponse,
};
