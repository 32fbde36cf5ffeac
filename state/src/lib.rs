pub mod config;
pub mod error;
pub mod jail_conf;
pub mod store;

pub use config::ConfigStore;
pub use error::RunjError;
pub use store::{State, StateOutput, StateStore, Status, DEFAULT_STATE_ROOT};
