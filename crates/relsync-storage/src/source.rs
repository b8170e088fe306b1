//! Windowed pull over the relationship store.
//!
//! A run covers `[skip, skip + count)` of the filtered collection. Pages are
//! reopened at the current index whenever a cursor dies early, and the number
//! of early page ends is capped so a collection whose cursor keeps timing out
//! cannot pin the process in a reopen loop.

use relsync_core::RelationshipRecord;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{PageError, RelationshipPage, RelationshipStore, StoreError};

/// Slice of the filtered collection a single run is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub skip: u64,
    pub count: u64,
}

impl Window {
    pub fn new(skip: u64, count: u64) -> Self {
        Self { skip, count }
    }

    pub fn end(&self) -> u64 {
        self.skip.saturating_add(self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceOutcome {
    /// The index reached the collection total.
    AllProcessed,
    /// The index reached the end of the requested window.
    WindowComplete,
    /// Pages kept ending early until the iteration ceiling was hit.
    MaxIterations,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::MaxIterations)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub pages_opened: u32,
    /// Pages that ended before the window or collection was exhausted.
    pub iterations: u32,
    pub timeouts: u32,
    pub page_errors: u32,
}

enum SourceState<'s> {
    Idle,
    Paging(Box<dyn RelationshipPage + 's>),
    Done(SourceOutcome),
}

pub struct RecordSource<'s> {
    store: &'s dyn RelationshipStore,
    total: u64,
    start: u64,
    index: u64,
    end: u64,
    max_iterations: u32,
    stats: SourceStats,
    state: SourceState<'s>,
}

impl<'s> RecordSource<'s> {
    /// Count the filtered collection and position the source at the window start.
    pub async fn open(
        store: &'s dyn RelationshipStore,
        window: Window,
        max_iterations: u32,
    ) -> Result<Self, StoreError> {
        let total = store.count().await?;
        info!(
            total,
            skip = window.skip,
            count = window.count,
            max_iterations,
            "relationship window opened"
        );
        Ok(Self {
            store,
            total,
            start: window.skip,
            index: window.skip,
            end: window.end(),
            max_iterations,
            stats: SourceStats::default(),
            state: SourceState::Idle,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Records handed out since the window start.
    pub fn processed(&self) -> u64 {
        self.index - self.start
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// `None` until the source has stopped.
    pub fn outcome(&self) -> Option<SourceOutcome> {
        match self.state {
            SourceState::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Next record in storage order, or `None` once the source is done.
    pub async fn next_record(&mut self) -> Option<RelationshipRecord> {
        loop {
            match std::mem::replace(&mut self.state, SourceState::Idle) {
                SourceState::Done(outcome) => {
                    self.state = SourceState::Done(outcome);
                    return None;
                }
                SourceState::Idle => {
                    if let Some(outcome) = self.check_guards() {
                        self.finish(outcome);
                        continue;
                    }
                    let store = self.store;
                    let limit = self.end - self.index;
                    self.stats.pages_opened += 1;
                    debug!(skip = self.index, limit, "opening relationship page");
                    self.state = SourceState::Paging(store.open_page(self.index, limit));
                }
                SourceState::Paging(mut page) => match page.next_record().await {
                    Ok(Some(record)) => {
                        self.index += 1;
                        debug!(index = self.index, "relationship consumed");
                        self.state = SourceState::Paging(page);
                        return Some(record);
                    }
                    Ok(None) => self.end_page(),
                    Err(err @ PageError::Timeout(_)) => {
                        self.stats.timeouts += 1;
                        warn!(index = self.index, error = %err, "relationship cursor timed out");
                        self.end_page();
                    }
                    Err(err @ PageError::Cursor(_)) => {
                        self.stats.page_errors += 1;
                        error!(index = self.index, error = %err, "relationship page abandoned");
                        self.end_page();
                    }
                },
            }
        }
    }

    // Guard order matters: a drained collection wins over the ceiling, the
    // ceiling wins over a drained window.
    fn check_guards(&self) -> Option<SourceOutcome> {
        if self.index >= self.total {
            return Some(SourceOutcome::AllProcessed);
        }
        if self.stats.iterations >= self.max_iterations {
            return Some(SourceOutcome::MaxIterations);
        }
        if self.index >= self.end {
            return Some(SourceOutcome::WindowComplete);
        }
        None
    }

    fn end_page(&mut self) {
        if self.index >= self.total || self.index >= self.end {
            return;
        }
        self.stats.iterations += 1;
        info!(
            resume_from = self.index + 1,
            processed = self.processed(),
            iteration = self.stats.iterations,
            "page ended early, starting over"
        );
    }

    fn finish(&mut self, outcome: SourceOutcome) {
        match outcome {
            SourceOutcome::AllProcessed => info!(index = self.index, "all items are processed"),
            SourceOutcome::WindowComplete => info!(index = self.index, "requested window processed"),
            SourceOutcome::MaxIterations => warn!(
                iterations = self.stats.iterations,
                index = self.index,
                "max iteration count reached"
            ),
        }
        self.state = SourceState::Done(outcome);
    }
}
