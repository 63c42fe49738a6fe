pub mod config;
mod db_file;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod io;
pub mod operation;
pub mod paths;
pub mod payload;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod soft_delete;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{ProvisionError, Result};
pub use runtime::Provisioner;
