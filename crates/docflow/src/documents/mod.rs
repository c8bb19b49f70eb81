pub mod model;
pub mod store;

pub use model::{file_extension, storage_key_for, Document, NewDocument, StorageStatus};
pub use store::{DocumentStore, SqliteDocumentStore};
