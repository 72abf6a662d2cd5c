pub mod consume;
pub mod entities;

pub use consume::{ConsumeStorage, StorageError, StoredConsumption};
