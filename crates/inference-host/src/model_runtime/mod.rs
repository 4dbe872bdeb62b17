//! Model runtime layer.
//!
//! A request flows through the locator (name → artifact, backend detection,
//! hub-native bridging), the platform resolver (device + compatibility) and
//! one `BackendLoader`, which starts an OpenAI-compatible runtime server.
//! `ModelManager` owns the result.
pub mod config_value;
pub mod format_detector;
pub mod gguf_header;
pub mod hub_client;
pub mod llamacpp_runtime;
pub mod locator;
pub mod platform;
pub mod prompt_cache;
pub mod registry;
pub mod request;
pub mod runtime_manager;
pub mod runtime_trait;
pub mod server_process;
pub mod tensorrt_runtime;
pub mod transformers_runtime;

pub use config_value::{ConfigSnapshot, ConfigValue};
pub use format_detector::FormatDetector;
pub use hub_client::{HubClient, HubFile};
pub use llamacpp_runtime::LlamaCppLoader;
pub use locator::ModelLocator;
pub use platform::{HostCapabilities, HostProbe, ResolvedDevice, SystemProbe};
pub use prompt_cache::PromptCache;
pub use registry::LoaderRegistry;
pub use request::{BackendKind, ComputeDType, DeviceRequest, LoadOptions, LoadRequest};
pub use runtime_manager::{HandlePair, InfoSnapshot, ModelManager};
pub use runtime_trait::{
    ArtifactFormat, BackendLoader, ChatMessage, CleanupOutcome, InferenceRequest, InferenceResponse, LaunchPlan,
    LoadOutcome, ModelHandle, ModelMetadata,
};
pub use server_process::{RuntimeEndpoint, ServerProcess};
pub use tensorrt_runtime::TensorRtLoader;
pub use transformers_runtime::TransformersLoader;
