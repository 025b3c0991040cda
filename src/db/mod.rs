//! SQLite persistence: pool setup, migrations, and repository functions.

pub mod model;
mod repo;

pub use model::*;
pub use repo::*;
