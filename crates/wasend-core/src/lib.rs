//! # wasend-core
//!
//! Core types, traits, configuration, and error handling for wasend.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod traits;
