#![deny(unsafe_code)]

//! Chat core of the AI storefront: threads with streamed assistant replies, plus
//! read-through catalogs of prompts, assistants and models.

/// `Storefront`: the services wired over one store.
pub mod app;
/// Thread repository and streaming dispatcher.
pub mod chat;
/// Read-through catalogs of prompts, assistants and models.
pub mod catalog;
/// Line-oriented chat console used by the binary.
pub mod console;
/// Layered settings: defaults, JSON file, then `STOREFRONT_` environment variables.
pub mod settings;

pub use app::{AppError, AppResult, RUNTIME_API_KEY_KEY, Storefront};
