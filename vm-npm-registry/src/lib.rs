//! # npm Registry
//!
//! An npm registry front-end serving hosted, proxy and group repositories.
//!
//! ## Features
//!
//! - **Hosted repositories**: accept publishes, extract base64 attachments
//!   to disk while parsing and serve them back as tarballs
//! - **Proxy repositories**: cache remote package documents with a freshness
//!   horizon, refresh them with conditional requests and fall back to the
//!   stored copy when the remote fails
//! - **Group repositories**: delegate to members in order
//! - **Streaming**: the registry root is parsed and produced one package at
//!   a time
//!
//! ## Key Modules
//!
//! - [`metadata`]: package model, parser, store and the metadata services
//! - [`tarball`]: tarball download and the validator chain
//! - [`repository`]: request resolution per repository
//! - [`server`]: HTTP routes
//! - [`config`], [`state`], [`error`], [`logging`]: ambient setup

pub mod artifacts;
pub mod config;
pub mod content;
pub mod error;
pub mod hash_utils;
pub mod logging;
pub mod metadata;
pub mod repository;
pub mod request;
pub mod server;
pub mod state;
pub mod tarball;
pub mod validation;

pub use config::Config;
pub use content::Content;
pub use error::{ApiErrorResponse, AppError, AppResult, ErrorCode};
pub use logging::init_subscriber;
pub use repository::{NpmRepository, RepositoryKind};
pub use server::{build_router, run_server};
pub use state::{AppState, SuccessResponse};
