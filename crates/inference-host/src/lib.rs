pub mod config;
pub mod error;
pub mod metrics;
pub mod model_runtime;
pub mod telemetry;

// Public API exports
pub use config::HostConfig;
pub use error::{ErrorKind, HostError, HostResult};
pub use model_runtime::{
    BackendKind, DeviceRequest, InfoSnapshot, LoadOptions, LoadRequest, ModelHandle, ModelManager, ModelMetadata,
};
