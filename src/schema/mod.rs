//! SchemaProvider (spec §4.1, component C1)

pub mod error;
pub mod provider;

pub use error::SchemaError;
pub use provider::SchemaProvider;
