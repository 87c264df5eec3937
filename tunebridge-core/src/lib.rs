//! tunebridge-core library interface
//!
//! Link parsing, platform adapters, matching and the conversion engine.
//! The `tunebridge` binary is a thin CLI over these modules.

pub mod adapters;
pub mod db;
pub mod delivery;
pub mod error;
pub mod link_parser;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ConvertError, ConvertResult};
pub use crate::link_parser::{HttpRedirectResolver, LinkParseError, LinkParser, RedirectResolver};
pub use crate::services::{ConversionEngine, Matcher, TaskTracker};
