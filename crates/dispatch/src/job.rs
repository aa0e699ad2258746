//! Statement jobs and their caller-side handles

use crate::error::DispatchError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_common::CommandKind;
use tessera_pool::Row;

/// One SQL statement bound for one shard.
#[derive(Debug, Clone)]
pub struct StatementJob {
    pub sql: String,
    pub kind: CommandKind,
    /// Server error code to swallow for this statement, e.g. cleanup of an
    /// object that may not exist.
    pub ignore_error: Option<u32>,
}

impl StatementJob {
    pub fn new(sql: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            sql: sql.into(),
            kind,
            ignore_error: None,
        }
    }

    pub fn ignoring(mut self, code: u32) -> Self {
        self.ignore_error = Some(code);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InFlight,
    Done,
    Failed,
}

struct JobState {
    status: JobStatus,
    affected_rows: u64,
    warnings: u32,
    rows: VecDeque<Row>,
    had_rows: bool,
    released: bool,
    error: Option<DispatchError>,
}

/// Caller-side view of a queued statement. Results land here when the round
/// trip completes; a row-returning result must be drained with
/// [`JobHandle::fetch_row`] or dropped with [`JobHandle::release_result`]
/// before the connection will take another job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<Mutex<JobState>>,
}

impl JobHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(JobState {
                status: JobStatus::Queued,
                affected_rows: 0,
                warnings: 0,
                rows: VecDeque::new(),
                had_rows: false,
                released: false,
                error: None,
            })),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status(), JobStatus::Done | JobStatus::Failed)
    }

    pub fn affected_rows(&self) -> u64 {
        self.state.lock().affected_rows
    }

    pub fn warnings(&self) -> u32 {
        self.state.lock().warnings
    }

    pub fn error(&self) -> Option<DispatchError> {
        self.state.lock().error.clone()
    }

    /// Pop the next result row, `None` once the result is exhausted.
    pub fn fetch_row(&self) -> Option<Row> {
        self.state.lock().rows.pop_front()
    }

    /// Discard whatever remains of the result set, freeing the connection
    /// for the next queued job.
    pub fn release_result(&self) {
        let mut state = self.state.lock();
        state.rows.clear();
        state.released = true;
    }

    /// Whether the result no longer pins the connection.
    pub(crate) fn result_released(&self) -> bool {
        let state = self.state.lock();
        !state.had_rows || state.released || state.rows.is_empty()
    }

    pub(crate) fn mark_inflight(&self) {
        self.state.lock().status = JobStatus::InFlight;
    }

    pub(crate) fn complete(&self, affected_rows: u64, warnings: u32, rows: Option<Vec<Row>>) {
        let mut state = self.state.lock();
        state.status = JobStatus::Done;
        state.affected_rows = affected_rows;
        state.warnings = warnings;
        if let Some(rows) = rows {
            state.had_rows = true;
            state.rows = rows.into();
        }
    }

    pub(crate) fn fail(&self, error: DispatchError) {
        let mut state = self.state.lock();
        state.status = JobStatus::Failed;
        state.error = Some(error);
    }
}
