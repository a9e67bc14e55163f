pub mod agent;
pub mod config;
pub mod http;
pub mod service;

pub use config::SelectorConfig;
pub use service::{ArmDescriptor, Selection, SelectorService};
