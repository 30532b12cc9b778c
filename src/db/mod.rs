//! SQLite persistence: schema bootstrap, connection pragmas, and the
//! repository layer the services talk to.

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::Repository;
