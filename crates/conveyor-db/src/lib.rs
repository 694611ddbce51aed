pub mod cache_repository;
pub mod config;
pub mod database;
pub mod job_repository;

pub use cache_repository::PgContentCache;
pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::PgJobBackend;
