pub mod config;
pub mod error;
pub mod rewrite;
pub mod types;
pub mod utils;

pub use config::{
    AdmissionConfig, ArtifactConfig, BatchSettings, BlockConfig, HealthConfig, PoolConfig,
    ResourceCacheConfig, ResultCacheConfig, RetryConfig, ServerConfig, Settings, TabConfig,
    TimeoutConfig, WatchdogConfig,
};
pub use error::{classify_driver_error, CaptureError, DriverFailure, ErrorKind};
pub use rewrite::{RewriteRule, UrlRewriter};
pub use types::{CaptureRequest, ImageFormat, MAX_DIMENSION, MIN_DIMENSION};
pub use utils::{extract_host, now_unix_secs, resource_fingerprint, result_fingerprint, sha256_hex};
