//! Event records flowing from request handlers to the worker pool

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Upper bound on filter pairs a single event may carry.
///
/// Filter matching costs O(definitions x submitted) per event.
pub const MAX_SUBMITTED_FILTERS: usize = 32;

/// What a request handler wants recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    pub metric_id: Uuid,
    pub project_id: Uuid,
    pub add: i64,
    pub remove: i64,
    /// category -> selected option name
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

impl EventRequest {
    pub fn new(metric_id: Uuid, project_id: Uuid, add: i64, remove: i64) -> Self {
        Self { metric_id, project_id, add, remove, filters: HashMap::new() }
    }

    pub fn with_filter(mut self, category: impl Into<String>, name: impl Into<String>) -> Self {
        self.filters.insert(category.into(), name.into());
        self
    }

    /// Net change this event applies to a metric total
    pub fn net_delta(&self) -> i64 {
        self.add - self.remove
    }

    /// Reject events that could never be applied
    pub fn validate(&self) -> Result<()> {
        if self.add < 0 || self.remove < 0 {
            return Err(BatchError::InvalidEvent(format!(
                "deltas must be non-negative (add={}, remove={})",
                self.add, self.remove
            )));
        }

        if self.filters.len() > MAX_SUBMITTED_FILTERS {
            return Err(BatchError::InvalidEvent(format!(
                "at most {} filters per event, got {}",
                MAX_SUBMITTED_FILTERS,
                self.filters.len()
            )));
        }

        Ok(())
    }
}

/// Successful outcome of one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    /// Project usage counter after the event's batch was committed
    pub monthly_event_count: i64,
}

/// Batch Result delivered to the submitting caller
pub type EventResult = std::result::Result<EventAck, BatchError>;

/// One queued event plus the single-use channel its result goes back on
#[derive(Debug)]
pub struct EventRecord {
    request: EventRequest,
    reply: oneshot::Sender<EventResult>,
}

impl EventRecord {
    /// Build a record and the receiver the caller waits on
    pub fn new(request: EventRequest) -> (Self, oneshot::Receiver<EventResult>) {
        let (reply, receiver) = oneshot::channel();
        (Self { request, reply }, receiver)
    }

    pub fn request(&self) -> &EventRequest {
        &self.request
    }

    pub fn metric_id(&self) -> Uuid {
        self.request.metric_id
    }

    pub fn project_id(&self) -> Uuid {
        self.request.project_id
    }

    pub(crate) fn into_parts(self) -> (EventRequest, oneshot::Sender<EventResult>) {
        (self.request, self.reply)
    }
}
