//! Stored procedures: query types registered by numeric id and the context they run in.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::kernel::Kernel;
use crate::protocol::{Fault, Message, Query};

/// Error raised while answering a query. Reported to the client as a Fault.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown query type {0}")]
    UnknownType(i32),
    #[error("{0}")]
    Failed(String),
}

/// Code run on a node that accepted a query. Runs on a blocking thread.
pub trait QueryType: Send + Sync + 'static {
    fn answer(&self, query: &Query, ctx: &mut QueryContext) -> Result<(), QueryError>;
}

impl<F> QueryType for F
where
    F: Fn(&Query, &mut QueryContext) -> Result<(), QueryError> + Send + Sync + 'static,
{
    fn answer(&self, query: &Query, ctx: &mut QueryContext) -> Result<(), QueryError> {
        self(query, ctx)
    }
}

#[derive(Default)]
pub(crate) struct QueryTypes {
    by_id: RwLock<HashMap<i32, Arc<dyn QueryType>>>,
}

impl QueryTypes {
    pub(crate) fn register(&self, id: i32, qt: Arc<dyn QueryType>) -> Option<Arc<dyn QueryType>> {
        self.by_id.write().insert(id, qt)
    }

    pub(crate) fn get(&self, id: i32) -> Option<Arc<dyn QueryType>> {
        self.by_id.read().get(&id).cloned()
    }
}

/// Handle given to a running query: emit results, forward onward.
pub struct QueryContext {
    kernel: Arc<Kernel>,
    query: Query,
    results: usize,
}

impl QueryContext {
    pub(crate) fn new(kernel: Arc<Kernel>, query: Query) -> Self {
        Self {
            kernel,
            query,
            results: 0,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Send a result payload to the client that originated the seed.
    pub fn add_result(&mut self, data: Vec<Bytes>) {
        self.results += 1;
        self.kernel.send(
            Message::Result {
                seed: self.query.seed,
                data,
            },
            self.query.client(),
        );
    }

    /// Report a non-fatal problem to the client; the query keeps running.
    pub fn fault(&mut self, message: impl Into<String>) {
        self.kernel.send(
            Message::Fault(Fault {
                seed: self.query.seed,
                message: Some(message.into()),
            }),
            self.query.client(),
        );
    }

    /// Continue this query on another partition (next generation, same seed).
    pub fn forward(&mut self, node_id: Option<i64>, payload: Vec<Bytes>) {
        self.kernel.forward_query(&self.query, node_id, payload);
    }

    /// Results emitted so far.
    pub fn result_count(&self) -> usize {
        self.results
    }
}
