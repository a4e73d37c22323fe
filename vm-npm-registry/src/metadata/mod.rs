//! # Package Metadata
//!
//! Everything between a package document on the wire and the record kept in
//! the store:
//!
//! - [`model`]: package roots, versions and attachments, with overlay
//! - [`parser`]: streaming JSON parsing and production
//! - [`store`]: persistence contract and the file-backed store
//! - [`generator`]: store-backed generation for one repository
//! - [`transport`]: remote registry fetches with conditional requests
//! - [`service`]: hosted, proxy and group metadata services

pub mod cursor;
pub mod generator;
pub mod model;
pub mod parser;
pub mod service;
pub mod store;
pub mod transport;

pub use cursor::{PackageRootCursor, PackageRootSource};
pub use generator::MetadataGenerator;
pub use model::{CacheInfo, PackageAttachment, PackageRoot, PackageVersion};
pub use parser::MetadataParser;
pub use service::{GroupMetadataService, MetadataService, ProxyMetadataService};
pub use store::{ExpireScope, FileMetadataStore, MetadataStore, PackageState};
pub use transport::{FetchOutcome, HttpMetadataTransport, ProxyMetadataTransport, RemoteRegistry};
