//! SQLite persistence.

pub mod pool;
pub mod run;

pub use pool::DatabasePool;
pub use run::SqliteRunRepository;
