pub mod config;
pub mod identity;

pub use config::{KdfConfig, ProvisionConfig, StorePaths, DEFAULT_CONFIG_FILE_NAME};
pub use identity::{IdentityDescriptor, RequestId};
