//! In-process typed event bus for the progress stream.
//!
//! Subscribers are invoked in subscription order on the publishing task.
//! A failing or panicking callback is logged and does not stop delivery
//! to the remaining subscribers. Once `unsubscribe` returns, the callback
//! is never invoked again.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use brand_audit_protocol::ConnectedInfo;
use brand_audit_protocol::ProgressUpdate;
use strum_macros::Display;

use crate::connection::ConnectionStatus;
use crate::heartbeat::ConnectionQuality;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(ConnectedInfo),
    ProgressUpdate {
        job_id: String,
        update: ProgressUpdate,
    },
    Pong {
        latency: Duration,
    },
    StatusChanged(ConnectionStatus),
    QualityChanged(ConnectionQuality),
    /// Reconnect budget exhausted; the manager stays idle until the next
    /// subscribe.
    ConnectionFailed {
        attempts: u32,
    },
    /// Advisory: nothing inbound for `silent_for`.
    ConnectionStale {
        silent_for: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Connected,
    ProgressUpdate,
    Pong,
    StatusChanged,
    QualityChanged,
    ConnectionFailed,
    ConnectionStale,
}

impl StreamEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::Connected(_) => EventType::Connected,
            StreamEvent::ProgressUpdate { .. } => EventType::ProgressUpdate,
            StreamEvent::Pong { .. } => EventType::Pong,
            StreamEvent::StatusChanged(_) => EventType::StatusChanged,
            StreamEvent::QualityChanged(_) => EventType::QualityChanged,
            StreamEvent::ConnectionFailed { .. } => EventType::ConnectionFailed,
            StreamEvent::ConnectionStale { .. } => EventType::ConnectionStale,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ProgressUpdate { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

pub type Callback = Arc<dyn Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync>;
pub type Filter = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

/// Receives join/leave requests for job-scoped subscriptions.
pub trait JobScope: Send + Sync {
    fn join(&self, job_id: &str);
    fn leave(&self, job_id: &str);
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<Filter>,
    /// Restricts job-tagged events to this job and joins it on the stream.
    pub job_id: Option<String>,
}

impl SubscribeOptions {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&StreamEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filter", &self.filter.is_some())
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Returned by [`EventDispatcher::subscribe`]; hand it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub event_type: EventType,
    id: u64,
}

struct Subscriber {
    id: u64,
    event_type: EventType,
    job_id: Option<String>,
    filter: Option<Filter>,
    callback: Callback,
    active: AtomicBool,
}

impl Subscriber {
    fn accepts(&self, event: &StreamEvent) -> bool {
        if !self.active.load(Ordering::Acquire) || self.event_type != event.event_type() {
            return false;
        }
        if let (Some(wanted), Some(actual)) = (self.job_id.as_deref(), event.job_id())
            && wanted != actual
        {
            return false;
        }
        self.filter.as_ref().is_none_or(|filter| filter(event))
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Arc<Subscriber>>,
}

#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
    job_scope: RwLock<Option<Arc<dyn JobScope>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.registry().subscribers.len())
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scope(&self) -> Option<Arc<dyn JobScope>> {
        self.job_scope
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs the collaborator that job-scoped subscriptions join through.
    pub fn set_job_scope(&self, scope: Arc<dyn JobScope>) {
        *self
            .job_scope
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(scope);
    }

    pub fn subscribe<F>(
        &self,
        event_type: EventType,
        callback: F,
        options: SubscribeOptions,
    ) -> SubscriptionHandle
    where
        F: Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let job_id = options.job_id.clone();
        let id = {
            let mut registry = self.registry();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.subscribers.push(Arc::new(Subscriber {
                id,
                event_type,
                job_id: options.job_id,
                filter: options.filter,
                callback: Arc::new(callback),
                active: AtomicBool::new(true),
            }));
            id
        };
        tracing::trace!(subscription = id, %event_type, job_id = ?job_id, "subscribed");

        if let (Some(job_id), Some(scope)) = (job_id, self.scope()) {
            scope.join(&job_id);
        }
        SubscriptionHandle { event_type, id }
    }

    /// Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let (removed, job_still_watched) = {
            let mut registry = self.registry();
            let Some(pos) = registry
                .subscribers
                .iter()
                .position(|s| s.id == handle.id && s.event_type == handle.event_type)
            else {
                return false;
            };
            let removed = registry.subscribers.remove(pos);
            removed.active.store(false, Ordering::Release);
            let still_watched = removed.job_id.as_deref().is_some_and(|job| {
                registry
                    .subscribers
                    .iter()
                    .any(|s| s.job_id.as_deref() == Some(job))
            });
            (removed, still_watched)
        };

        if let (Some(job_id), false) = (removed.job_id.as_deref(), job_still_watched)
            && let Some(scope) = self.scope()
        {
            scope.leave(job_id);
        }
        true
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.registry()
            .subscribers
            .iter()
            .filter(|s| s.event_type == event_type)
            .count()
    }

    /// Delivers `event` and returns how many callbacks ran.
    pub fn publish(&self, event: &StreamEvent) -> usize {
        let subscribers = self.registry().subscribers.clone();
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.accepts(event)) {
            delivered += 1;
            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    subscription = subscriber.id,
                    event = %event.event_type(),
                    "event callback failed: {err:#}"
                ),
                Err(_) => tracing::error!(
                    subscription = subscriber.id,
                    event = %event.event_type(),
                    "event callback panicked"
                ),
            }
        }
        delivered
    }
}
