// Library exports for the dataset engine and its integration tests

mod fsio;

pub mod dataset;
pub mod index;
pub mod locations;
pub mod logging;
pub mod mover;
pub mod pipeline;
pub mod schema;
pub mod sync;
pub mod transport;

// In-memory remote used by unit and integration tests
pub mod test_support;

// Re-export the owner type at crate root for easier access
pub use dataset::Dataset;

/// Metadata directory kept under every dataset root.
pub const META_DIR: &str = ".blackbird";

/// File names inside [`META_DIR`].
pub const LOCATIONS_FILE: &str = "locations.json";
pub const SCHEMA_FILE: &str = "schema.json";
pub const INDEX_FILE: &str = "index.bin";
