//! SQLite persistence.

pub mod pool;
pub mod resource;

pub use pool::{default_database_url, DatabasePool};
pub use resource::SqliteResourceRepository;
