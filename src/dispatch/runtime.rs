//! Bounded dispatch runtime.
//!
//! Producers hand events to a fixed pool of named worker threads through a
//! bounded crossbeam channel. `submit` never blocks: a full queue is reported
//! as `QueueFull` so the transport can apply backpressure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::DispatchRuntimeConfig;
use crate::error::{CorrelationError, CorrelationResult, ExecutionError};
use crate::event::EventInstance;

use super::coordinator::{DispatchCoordinator, DispatchResult};

const POOL_NAME: &str = "dispatch";

enum Job {
    Dispatch {
        event: EventInstance,
        reply: Sender<CorrelationResult<DispatchResult>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(
        workers: usize,
        queue_capacity: usize,
        coordinator: &Arc<DispatchCoordinator>,
    ) -> CorrelationResult<Self> {
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let coordinator = Arc::clone(coordinator);
            let handle = thread::Builder::new()
                .name(format!("corrflow-{POOL_NAME}-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Dispatch { event, reply }) => {
                            let _ = reply.send(dispatch_guarded(&coordinator, &event));
                        }
                        Err(_) => break,

                        #[cfg(test)]
                        Ok(Job::Sleep { duration, reply }) => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                })
                .map_err(|e| CorrelationError::internal(format!("failed to spawn dispatch worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx,
            workers: handles,
            queue_capacity,
        })
    }

    fn try_submit(&self, job: Job) -> CorrelationResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CorrelationError::Execution(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    fn shutdown(self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Runs one dispatch; a panic becomes an internal error and the worker lives on.
fn dispatch_guarded(coordinator: &DispatchCoordinator, event: &EventInstance) -> CorrelationResult<DispatchResult> {
    panic::catch_unwind(AssertUnwindSafe(|| coordinator.dispatch(event))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(event_id = %event.id(), panic = %message, "dispatch panicked");
        Err(CorrelationError::internal(format!("dispatch panicked: {message}")))
    })
}

fn disconnected() -> CorrelationError {
    CorrelationError::Execution(ExecutionError::Disconnected {
        path: POOL_NAME.to_string(),
    })
}

/// Pending result of a submitted event.
pub struct DispatchHandle {
    rx: Receiver<CorrelationResult<DispatchResult>>,
}

impl DispatchHandle {
    /// Waits for the dispatch to complete.
    pub fn join(self) -> CorrelationResult<DispatchResult> {
        self.rx.recv().map_err(|_| disconnected())?
    }

    /// Waits for the dispatch to complete with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> CorrelationResult<DispatchResult> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CorrelationError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })?
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle").finish_non_exhaustive()
    }
}

/// Worker pool running one shared [`DispatchCoordinator`].
pub struct DispatchRuntime {
    coordinator: Arc<DispatchCoordinator>,
    pool: Option<WorkerPool>,
}

impl DispatchRuntime {
    /// Start the workers.
    pub fn new(coordinator: Arc<DispatchCoordinator>, config: DispatchRuntimeConfig) -> CorrelationResult<Self> {
        let config = config.validate()?;
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &coordinator)?;
        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "dispatch runtime started"
        );
        Ok(Self {
            coordinator,
            pool: Some(pool),
        })
    }

    /// Start the workers with the runtime section of the coordinator's config.
    pub fn from_coordinator(coordinator: Arc<DispatchCoordinator>) -> CorrelationResult<Self> {
        let config = coordinator.config().runtime.clone();
        Self::new(coordinator, config)
    }

    /// Queue an event without blocking.
    pub fn submit(&self, event: EventInstance) -> CorrelationResult<DispatchHandle> {
        let (tx, rx) = bounded::<CorrelationResult<DispatchResult>>(1);
        self.pool()?.try_submit(Job::Dispatch { event, reply: tx })?;
        Ok(DispatchHandle { rx })
    }

    /// Queue an event and wait for its result.
    pub fn dispatch(&self, event: EventInstance) -> CorrelationResult<DispatchResult> {
        self.submit(event)?.join()
    }

    #[must_use]
    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    /// Stop accepting events, finish queued ones and join the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn pool(&self) -> CorrelationResult<&WorkerPool> {
        self.pool.as_ref().ok_or_else(disconnected)
    }

    fn stop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            tracing::info!("dispatch runtime stopped");
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> CorrelationResult<Receiver<()>> {
        let (tx, rx) = bounded::<()>(1);
        self.pool()?.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for DispatchRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("coordinator", &self.coordinator)
            .field("running", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::InMemoryExecutionEngine;
    use crate::storage::{InMemoryReferenceLedger, InMemorySubscriptionStore};
    use crate::subscription::{EventSubscription, ScopeType};

    fn runtime(workers: usize, queue_capacity: usize) -> (DispatchRuntime, Arc<InMemoryExecutionEngine>) {
        let engine = Arc::new(InMemoryExecutionEngine::new());
        engine.deploy_definition("case-1", ScopeType::Cmmn).unwrap();
        let coordinator = DispatchCoordinator::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryReferenceLedger::new()),
            Arc::clone(&engine) as Arc<dyn crate::engine::ExecutionEngine>,
        );
        coordinator
            .register_subscription(
                EventSubscription::start_definition("myEvent", "case-1")
                    .correlate("customerId", "kermit")
                    .unique_instance(true)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let runtime = DispatchRuntime::new(
            Arc::new(coordinator),
            DispatchRuntimeConfig {
                workers,
                queue_capacity,
            },
        )
        .unwrap();
        (runtime, engine)
    }

    fn event() -> EventInstance {
        EventInstance::builder("myEvent")
            .value("customerId", "kermit")
            .build()
            .unwrap()
    }

    #[test]
    fn dispatch_runs_on_worker() {
        let (runtime, engine) = runtime(2, 16);
        let result = runtime.dispatch(event()).unwrap();
        assert_eq!(result.created_count(), 1);
        assert_eq!(engine.instance_count(), 1);
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let (runtime, _engine) = runtime(1, 1);

        // Occupy the only worker, then fill the single queue slot.
        let sleeping = runtime.submit_sleep(Duration::from_millis(200)).unwrap();
        thread::sleep(Duration::from_millis(50));
        let queued = runtime.submit(event()).unwrap();

        let err = runtime.submit(event()).unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::Execution(ExecutionError::QueueFull { capacity: 1 })
        ));
        assert!(err.is_retryable());

        sleeping.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(queued.join().unwrap().created_count(), 1);
    }

    #[test]
    fn shutdown_drains_queued_events() {
        let (runtime, engine) = runtime(1, 8);
        let handles: Vec<_> = (0..4).map(|_| runtime.submit(event()).unwrap()).collect();
        runtime.shutdown();

        let created: usize = handles.into_iter().map(|h| h.join().unwrap().created_count()).sum();
        assert_eq!(created, 1);
        assert_eq!(engine.instance_count(), 1);
    }

    struct PanickingEngine;

    impl crate::engine::ExecutionEngine for PanickingEngine {
        fn trigger_listener(
            &self,
            scope_ref: &str,
            _: &crate::projection::ScopeVariables,
        ) -> Result<(), crate::error::EngineError> {
            panic!("listener {scope_ref} exploded");
        }

        fn create_instance(
            &self,
            _: crate::engine::StartInstanceRequest,
        ) -> Result<crate::engine::InstanceId, crate::error::EngineError> {
            unreachable!("no start subscriptions registered")
        }

        fn find_by_reference(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<crate::engine::InstanceId>, crate::error::EngineError> {
            Ok(None)
        }
    }

    #[test]
    fn panicking_dispatch_reports_error_and_keeps_worker() {
        let coordinator = DispatchCoordinator::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryReferenceLedger::new()),
            Arc::new(PanickingEngine),
        );
        coordinator
            .register_subscription(EventSubscription::running_listener("myEvent", "inst-1").build().unwrap())
            .unwrap();
        let runtime = DispatchRuntime::new(
            Arc::new(coordinator),
            DispatchRuntimeConfig {
                workers: 1,
                queue_capacity: 4,
            },
        )
        .unwrap();

        let err = runtime.dispatch(event()).unwrap_err();
        assert!(err.to_string().contains("listener inst-1 exploded"));

        // The single worker is still there to take the next event.
        let quiet = EventInstance::builder("quietEvent").build().unwrap();
        let result = runtime
            .submit(quiet)
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(result.is_noop());
    }

    #[test]
    fn rejects_zero_workers() {
        let coordinator = Arc::new(DispatchCoordinator::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryReferenceLedger::new()),
            Arc::new(InMemoryExecutionEngine::new()),
        ));
        let err = DispatchRuntime::new(
            coordinator,
            DispatchRuntimeConfig {
                workers: 0,
                queue_capacity: 1,
            },
        )
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn join_reports_disconnected_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<CorrelationResult<DispatchResult>>(1);
        drop(tx);

        let err = DispatchHandle { rx }.join().unwrap_err();
        let CorrelationError::Execution(ExecutionError::Disconnected { path }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, "dispatch");
    }

    #[test]
    fn join_timeout_reports_timeout_while_pending() {
        let (_tx, rx) = bounded::<CorrelationResult<DispatchResult>>(1);
        let err = DispatchHandle { rx }.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::Execution(ExecutionError::Timeout { duration_ms: 10 })
        ));
    }
}
