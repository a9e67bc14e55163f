pub mod config;
pub mod gate;
pub mod http;
pub mod selector_client;
pub mod service;
pub mod token;

pub use config::ProxyConfig;
pub use selector_client::{HttpSelectorClient, LocalSelectorClient, SelectorClient};
pub use service::{ProxyService, SelectOutcome};
pub use token::{SelectionEntry, TokenCodec, TokenError};
