pub mod identity_store;
pub mod temp_files;

pub use identity_store::{IdentityEntry, IdentityStore};
pub use temp_files::{PendingDeletion, SavedImage, TempFileManager};
