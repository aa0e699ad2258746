//! Shard lock-wait diagnostics
//!
//! Each shard's storage engine exposes a read-only join of its lock-wait
//! and transaction views. One row per waiter/blocker pair, both sides
//! carrying the same five columns: external transaction id literal, native
//! connection id, start timestamp, rows changed, rows locked.

use tessera_common::GlobalTxnId;
use tessera_pool::Row;

/// The per-shard diagnostic query. Only issued once the shard's reported
/// version string has been confirmed to belong to a compatible engine
/// family.
pub const DIAG_QUERY: &str = "\
SELECT waiter.external_txn_id, waiter.conn_id, waiter.start_ts, \
waiter.rows_changed, waiter.rows_locked, \
blocker.external_txn_id, blocker.conn_id, blocker.start_ts, \
blocker.rows_changed, blocker.rows_locked \
FROM information_schema.tessera_lock_waits lw \
JOIN information_schema.tessera_trx waiter ON waiter.trx_id = lw.requesting_trx_id \
JOIN information_schema.tessera_trx blocker ON blocker.trx_id = lw.blocking_trx_id";

/// One side of a waiter/blocker pair as observed on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchObservation {
    pub txn: GlobalTxnId,
    pub conn_id: u32,
    pub start_ts: i64,
    pub rows_changed: u64,
    pub rows_locked: u64,
}

/// One waiter/blocker row from the diagnostic view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagRow {
    pub waiter: BranchObservation,
    pub blocker: BranchObservation,
}

/// Whether a shard's reported version belongs to an engine family that
/// exposes the diagnostic views.
pub fn version_supported(version: &str, family_marker: &str) -> bool {
    version.contains(family_marker)
}

/// Parse diagnostic result rows. Rows that do not parse (local
/// transactions without an external id, nulls) are skipped.
pub fn parse_rows(rows: &[Row]) -> Vec<DiagRow> {
    rows.iter()
        .filter_map(|row| {
            let waiter = parse_half(row, 0)?;
            let blocker = parse_half(row, 5)?;
            Some(DiagRow { waiter, blocker })
        })
        .collect()
}

fn parse_half(row: &Row, offset: usize) -> Option<BranchObservation> {
    let cell = |i: usize| row.get(offset + i)?.as_deref();
    let txn = GlobalTxnId::from_diag_literal(cell(0)?).ok()?;
    Some(BranchObservation {
        txn,
        conn_id: cell(1)?.parse().ok()?,
        start_ts: cell(2)?.parse().ok()?,
        rows_changed: cell(3)?.parse().ok()?,
        rows_locked: cell(4)?.parse().ok()?,
    })
}
