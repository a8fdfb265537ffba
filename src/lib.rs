pub mod app;
pub mod catalog;
pub mod config;
pub mod downloader;
pub mod env_flags;
pub mod error;
pub mod extensions;
pub mod layout;
pub mod model;
pub mod scheduler;
pub mod transport;
pub mod webui;

pub use error::{FetchError, FetchResult};
