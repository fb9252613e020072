pub mod config;
pub mod error;
pub mod http_client;
pub mod poller;
pub mod provisioner;
pub mod signing;
pub mod tracker;

pub use error::ProvisionError;
pub use http_client::HttpSigningClient;
pub use poller::{await_approval, PollOptions};
pub use provisioner::{
    ProvisionOutcome, Provisioner, ProvisioningState, IDENTITY_KEY_ALIAS, PENDING_KEY_ALIAS,
    ROOT_CA_ALIAS,
};
pub use signing::{RetrieveOutcome, SigningClient, SigningError};
pub use tracker::RequestTracker;
