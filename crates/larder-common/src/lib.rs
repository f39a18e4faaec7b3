pub mod error;
pub mod migration;
pub mod validation;

pub use error::{Error, Result};
pub use migration::{MigrationDefinition, MigrationRecord};
