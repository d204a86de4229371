#![allow(clippy::uninlined_format_args)]

pub mod cache;
pub mod config;
pub mod data;
pub mod discourse;
pub mod pagination;
pub mod session;
pub mod tree;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use session::TopicSession;
