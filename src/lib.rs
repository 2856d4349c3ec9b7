//! Library entry point for the modcrane CLI.

pub mod cache;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod inventory;
pub mod layer_cache;
pub mod metadata;
pub mod model;
pub mod modulefile;
pub mod pool;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod scanner;
pub mod scanners;
pub mod system;
pub mod utils;
pub mod validate;
