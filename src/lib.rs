mod config;
mod descriptor;
mod digest;
mod error;
mod mirror;
mod registry_client;
mod router;
pub mod server;
mod session;
mod vector_index;

pub use config::{Config, Mode, Transport};
pub use descriptor::ServerDescriptor;
pub use error::{ConfigError, DescriptorError};
pub use mirror::RegistryMirror;
pub use registry_client::{RegistryClient, RegistryClientConfig};
pub use router::{Router, RouterMode, RouterServer};
pub use vector_index::VectorIndex;
