pub mod persistence;
pub mod snapshot;
pub mod store;
pub mod types;

pub use persistence::StatePersistence;
pub use snapshot::{StateSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use types::*;
