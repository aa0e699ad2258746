//! Session preamble
//!
//! A freshly established or reset connection must have its session set up
//! before any transactional statement goes out: character set, autocommit,
//! cluster/session identity variables, any cached user session variables,
//! and — when the shard is replicated — a primary-role probe. The whole
//! preamble is bundled into the same round trip as the first caller
//! statement, never a round trip of its own.

use tessera_common::CompNodeId;

/// Cached session variables, resent whenever a connection is reset.
#[derive(Debug, Clone, Default)]
pub struct SessionVars {
    vars: Vec<(String, String)>,
}

impl SessionVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a variable; a later set of the same name replaces the value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.vars.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.vars.push((name, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// The preamble statements for one fresh/reset connection, plus where the
/// primary-role probe sits in the batch so its reply can be verified.
#[derive(Debug, Clone)]
pub struct Preamble {
    stmts: Vec<String>,
    primary_probe: Option<usize>,
}

impl Preamble {
    /// Build the preamble. `verify_primary` is set for replicated
    /// deployments where a stale master must be caught before the first
    /// transactional statement.
    pub fn build(comp_node: CompNodeId, vars: &SessionVars, verify_primary: bool) -> Self {
        let mut stmts = vec![
            "SET NAMES utf8mb4".to_string(),
            "SET SESSION autocommit = 1".to_string(),
            format!("SET SESSION comp_node_id = {comp_node}"),
        ];
        for (name, value) in vars.iter() {
            stmts.push(format!("SET SESSION {name} = {value}"));
        }
        let primary_probe = if verify_primary {
            stmts.push("SELECT @@super_read_only".to_string());
            Some(stmts.len() - 1)
        } else {
            None
        };
        Self {
            stmts,
            primary_probe,
        }
    }

    /// Number of statements (and thus replies) the preamble occupies.
    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Reply index of the primary-role probe, if present.
    pub fn primary_probe(&self) -> Option<usize> {
        self.primary_probe
    }

    /// Prepend the preamble to a caller statement, forming one batch.
    pub fn prepend_to(&self, stmt: &str) -> String {
        let mut batch = self.stmts.join(";");
        batch.push(';');
        batch.push_str(stmt);
        batch
    }
}
