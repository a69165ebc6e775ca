#![recursion_limit = "256"]

pub mod batching;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod error;
pub mod export;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod training;
pub mod vocabulary;

pub use error::{Error, Result};
