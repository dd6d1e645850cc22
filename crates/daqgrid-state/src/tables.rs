//! redb table definitions for the identity store.

use redb::TableDefinition;

/// Singleton slots keyed by name; the only key in use is
/// [`FRAMEWORK_ID_KEY`].
pub const IDENTITY: TableDefinition<&str, &str> = TableDefinition::new("identity");

/// Key of the framework identity slot.
pub const FRAMEWORK_ID_KEY: &str = "framework_id";
