pub mod access;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod migration;
pub mod providers;
pub mod store;
pub mod taxonomy;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
