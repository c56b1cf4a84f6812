pub mod approvals;
pub mod connections;
pub mod database;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod runs;
pub mod schema;
pub mod sessions;
pub mod state;

pub use database::Database;
pub use error::StoreError;
