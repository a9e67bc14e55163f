pub mod config;
pub mod http;
pub mod service;
pub mod trainer;

pub use config::TrainerConfig;
pub use service::{ExperimentStats, TrainerService};
pub use trainer::BatchTrainer;
