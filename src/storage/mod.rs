pub mod db;
pub mod error;
pub mod time;

pub use db::SqliteStore;
pub use error::{StoreError, StoreResult};
