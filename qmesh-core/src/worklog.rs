//! Lifecycle record of one received query instance.

use std::time::Instant;

use crate::protocol::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Arrived,
    /// Waiting for the client's trace OK.
    Held,
    Unheld,
    Runqueued,
    Started,
}

#[derive(Debug, Clone)]
pub struct Worklog {
    query: Query,
    state: WorkState,
    arrived: Instant,
    held: Option<Instant>,
    unheld: Option<Instant>,
    runqueued: Option<Instant>,
    started: Option<Instant>,
}

impl Worklog {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            state: WorkState::Arrived,
            arrived: Instant::now(),
            held: None,
            unheld: None,
            runqueued: None,
            started: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived
    }

    pub fn held_at(&self) -> Option<Instant> {
        self.held
    }

    pub fn unheld_at(&self) -> Option<Instant> {
        self.unheld
    }

    pub fn runqueued_at(&self) -> Option<Instant> {
        self.runqueued
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    pub(crate) fn hold(&mut self) -> bool {
        if self.state != WorkState::Arrived {
            return false;
        }
        self.state = WorkState::Held;
        self.held = Some(Instant::now());
        true
    }

    /// Only the first caller for a held instance wins.
    pub(crate) fn unhold(&mut self) -> bool {
        if self.state != WorkState::Held {
            return false;
        }
        self.state = WorkState::Unheld;
        self.unheld = Some(Instant::now());
        true
    }

    pub(crate) fn runqueue(&mut self) -> bool {
        if !matches!(self.state, WorkState::Arrived | WorkState::Unheld) {
            return false;
        }
        self.state = WorkState::Runqueued;
        self.runqueued = Some(Instant::now());
        true
    }

    pub(crate) fn start(&mut self) {
        self.state = WorkState::Started;
        self.started = Some(Instant::now());
    }
}
