//! Shared services

mod mirror;

pub use mirror::LocalMirror;
