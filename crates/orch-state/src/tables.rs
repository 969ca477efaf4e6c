//! redb table definitions for the invocation log.
//!
//! Records are JSON in `&[u8]` value columns. The history index uses the
//! composite key `{deployment_id}:{invocation_id}` for prefix scans.

use redb::TableDefinition;

/// Invocation records keyed by `{invocation_id}`.
pub const INVOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("invocations");

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Per-deployment history index: `{deployment_id}:{invocation_id}` → invocation id.
pub const HISTORY: TableDefinition<&str, &str> = TableDefinition::new("history");
