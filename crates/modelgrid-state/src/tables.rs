//! redb table definitions for the Modelgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Deployment keys follow the pattern `{workspace_id}:{deployment_id}`.

use redb::TableDefinition;

/// Deployment history keyed by `{workspace_id}:{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Development instances keyed by `{name}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Deployment locks keyed by `{workspace_id}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
