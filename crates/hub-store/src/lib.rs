pub mod database;
pub mod deltas;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod runs;
pub mod schema;
pub mod scheduled;
pub mod threads;

pub use database::Database;
pub use error::StoreError;
