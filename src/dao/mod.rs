/// Storage entities shared by every backend.
pub mod models;
/// Session, vote and claim storage behind the [`session_store::SessionStore`] trait.
pub mod session_store;
/// Storage abstraction layer errors.
pub mod storage;
