//! Device-local database layer for the patrol mirror

mod connection;
mod migrations;
mod mirror_repository;

pub use connection::Database;
pub use mirror_repository::{LibSqlMirrorRepository, MirrorRepository};
