// Configuration loading

pub mod settings;

pub use settings::{DocumentSettings, StorageEncoding, SCRATCH_WIDTH};
