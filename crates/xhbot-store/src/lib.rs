pub mod database;
pub mod error;
pub mod schema;
pub mod sessions;
pub mod tokens;

pub use database::Database;
pub use error::StoreError;
pub use sessions::MemorySessionStore;
pub use tokens::{BotTokenRepo, BotTokenRow, IssuedToken};
