pub mod blob;
pub mod client;
pub mod error;

pub use crate::blob::HttpBlobStore;
pub use crate::client::{ClientSettings, HttpCatalogClient};
pub use crate::error::CatalogFetchError;
