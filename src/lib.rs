#![forbid(unsafe_code)]

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod epub;
pub mod error;
pub mod export;
pub mod extract;
pub mod fetch;
pub mod fill;
pub mod html;
pub mod images;
pub mod ingest;
pub mod logging;
pub mod provider;
pub mod store;

pub use error::{Error, Result};
