//! MongoDB implementation of [`SessionStore`](crate::dao::session_store::SessionStore).

mod config;
mod connection;
mod error;
mod models;
mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoSessionStore;
