pub mod credentials;
pub mod decoder;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod relay;
pub mod store;

pub use credentials::{ConfigCredentialStore, CredentialStore};
pub use registry::SessionRegistry;
pub use relay::{RelayService, RelaySettings, SessionRequest};
pub use store::{ChatStore, MemoryChatStore, MongoChatStore};
