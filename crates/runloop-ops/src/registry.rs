use crate::{
    CancelContext, MetadataPatch, Operation, OperationContext, OperationError, OperationFailure,
    OperationFilter, OperationHandle, OperationMetadata, OperationProgress, OperationStatus,
    OperationType, StartOperation,
};
use runloop_state::{Clock, SystemClock};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Terminal operations older than this are dropped when a top-level
/// operation starts.
pub const DEFAULT_COMPLETED_RETENTION_MS: u64 = 30_000;

pub const PARENT_CANCELLED_REASON: &str = "Parent operation cancelled";

pub type CancelHandler = Box<dyn FnOnce(CancelContext) + Send>;

struct OperationEntry {
    operation: Operation,
    abort: CancellationToken,
    cancel_handler: Option<CancelHandler>,
}

#[derive(Default)]
struct RegistryInner {
    operations: HashMap<String, OperationEntry>,
    by_type: HashMap<OperationType, Vec<String>>,
    by_message: HashMap<String, Vec<String>>,
    message_operation: HashMap<String, String>,
    by_context: HashMap<String, Vec<String>>,
}

impl RegistryInner {
    fn link_message(&mut self, message_id: &str, operation_id: &str) {
        self.message_operation
            .insert(message_id.to_string(), operation_id.to_string());
        let ids = self.by_message.entry(message_id.to_string()).or_default();
        if !ids.iter().any(|id| id == operation_id) {
            ids.push(operation_id.to_string());
        }
    }

    fn snapshot(&self, operation_id: &str) -> Option<Operation> {
        self.operations
            .get(operation_id)
            .map(|entry| entry.operation.clone())
    }

    fn snapshots(&self, ids: Option<&Vec<String>>) -> Vec<Operation> {
        ids.map(|ids| ids.iter().filter_map(|id| self.snapshot(id)).collect())
            .unwrap_or_default()
    }

    /// Running descendants of `operation_id`, deepest first.
    fn running_descendants(&self, operation_id: &str, out: &mut Vec<String>) {
        let Some(entry) = self.operations.get(operation_id) else {
            return;
        };
        for child_id in &entry.operation.child_operation_ids {
            self.running_descendants(child_id, out);
            let running = self
                .operations
                .get(child_id)
                .is_some_and(|child| child.operation.status == OperationStatus::Running);
            if running && !out.contains(child_id) {
                out.push(child_id.clone());
            }
        }
    }

    fn remove(&mut self, operation_id: &str) {
        let Some(entry) = self.operations.remove(operation_id) else {
            return;
        };
        let operation = entry.operation;
        // Messages may be linked through the context or by explicit
        // association, so every index is swept.
        prune_index(&mut self.by_type, operation_id);
        prune_index(&mut self.by_message, operation_id);
        prune_index(&mut self.by_context, operation_id);
        if let Some(parent_id) = &operation.parent_operation_id {
            if let Some(parent) = self.operations.get_mut(parent_id) {
                parent
                    .operation
                    .child_operation_ids
                    .retain(|id| id != operation_id);
            }
        }
        let by_message = &self.by_message;
        self.message_operation.retain(|message_id, id| {
            if id.as_str() != operation_id {
                return true;
            }
            match by_message.get(message_id).and_then(|ids| ids.last()) {
                Some(latest) => {
                    *id = latest.clone();
                    true
                }
                None => false,
            }
        });
    }
}

/// Drops `operation_id` from every entry and removes keys left empty.
fn prune_index<K>(index: &mut HashMap<K, Vec<String>>, operation_id: &str) {
    index.retain(|_, ids| {
        ids.retain(|id| id != operation_id);
        !ids.is_empty()
    });
}

fn context_key(session_id: &str, topic_id: Option<&str>) -> String {
    format!("{session_id}::{}", topic_id.unwrap_or("default"))
}

/// Shared registry of in-flight operations. Cloning yields another handle to
/// the same registry.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    clock: Arc<dyn Clock>,
    completed_retention_ms: u64,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            clock,
            completed_retention_ms: DEFAULT_COMPLETED_RETENTION_MS,
        }
    }

    pub fn with_completed_retention_ms(mut self, retention_ms: u64) -> Self {
        self.completed_retention_ms = retention_ms;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("operation registry mutex poisoned")
    }

    pub fn start_operation(&self, params: StartOperation) -> OperationHandle {
        let operation_id = format!("op_{}", Uuid::new_v4().simple());
        let abort = CancellationToken::new();
        let now = self.clock.now();
        let is_top_level = params.parent_operation_id.is_none();

        {
            let mut inner = self.lock();
            let parent_context = params
                .parent_operation_id
                .as_deref()
                .and_then(|parent_id| inner.operations.get(parent_id))
                .map(|parent| parent.operation.context.clone());
            let context = match &parent_context {
                Some(parent) => params.context.inherit_from(parent),
                None => params.context,
            };

            let mut metadata = OperationMetadata::started_at(now);
            params.metadata.apply(&mut metadata);

            let operation = Operation {
                id: operation_id.clone(),
                op_type: params.op_type,
                status: OperationStatus::Running,
                context: context.clone(),
                parent_operation_id: params.parent_operation_id.clone(),
                child_operation_ids: Vec::new(),
                metadata,
                label: params.label,
                description: params.description,
            };

            inner.operations.insert(
                operation_id.clone(),
                OperationEntry {
                    operation,
                    abort: abort.clone(),
                    cancel_handler: None,
                },
            );
            inner
                .by_type
                .entry(params.op_type)
                .or_default()
                .push(operation_id.clone());
            if let Some(message_id) = &context.message_id {
                inner.link_message(message_id, &operation_id);
            }
            if let Some(session_id) = &context.session_id {
                inner
                    .by_context
                    .entry(context_key(session_id, context.topic_id.as_deref()))
                    .or_default()
                    .push(operation_id.clone());
            }
            if let Some(parent_id) = &params.parent_operation_id {
                if let Some(parent) = inner.operations.get_mut(parent_id) {
                    parent
                        .operation
                        .child_operation_ids
                        .push(operation_id.clone());
                }
            }
        }

        tracing::debug!(
            operation_id = %operation_id,
            op_type = %params.op_type,
            parent_operation_id = ?params.parent_operation_id,
            "operation_started"
        );

        if is_top_level {
            self.cleanup_completed_operations(self.completed_retention_ms);
        }

        OperationHandle {
            operation_id,
            abort,
        }
    }

    /// Links a message to an operation. Repeating the same pair changes nothing.
    pub fn associate_message_with_operation(
        &self,
        message_id: &str,
        operation_id: &str,
    ) -> Result<(), OperationError> {
        let mut inner = self.lock();
        if !inner.operations.contains_key(operation_id) {
            return Err(OperationError::NotFound(operation_id.to_string()));
        }
        inner.link_message(message_id, operation_id);
        Ok(())
    }

    /// Marks a running operation completed. Returns `Ok(false)` when the
    /// operation had already reached a terminal status.
    pub fn complete_operation(
        &self,
        operation_id: &str,
        patch: Option<MetadataPatch>,
    ) -> Result<bool, OperationError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let entry = inner
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))?;
        if entry.operation.status.is_terminal() {
            return Ok(false);
        }
        entry.operation.status = OperationStatus::Completed;
        entry.operation.metadata.finish_at(now);
        if let Some(patch) = patch {
            patch.apply(&mut entry.operation.metadata);
        }
        entry.cancel_handler = None;
        tracing::debug!(
            operation_id = %operation_id,
            op_type = %entry.operation.op_type,
            duration_ms = ?entry.operation.metadata.duration_ms,
            "operation_completed"
        );
        Ok(true)
    }

    pub fn fail_operation(
        &self,
        operation_id: &str,
        failure: OperationFailure,
    ) -> Result<bool, OperationError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let entry = inner
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))?;
        if entry.operation.status.is_terminal() {
            return Ok(false);
        }
        tracing::debug!(
            operation_id = %operation_id,
            op_type = %entry.operation.op_type,
            error = %failure.message,
            "operation_failed"
        );
        entry.operation.status = OperationStatus::Failed;
        entry.operation.metadata.finish_at(now);
        entry.operation.metadata.error = Some(failure);
        entry.cancel_handler = None;
        Ok(true)
    }

    /// Cancels a running operation and all of its running descendants.
    ///
    /// Descendants are aborted and marked first, deepest first, then the
    /// operation itself. Every abort token fires and every handler runs at most
    /// once no matter how many callers race here. Handlers run after the
    /// registry lock is released.
    pub fn cancel_operation(
        &self,
        operation_id: &str,
        reason: &str,
    ) -> Result<bool, OperationError> {
        let now = self.clock.now();
        let mut handlers = Vec::new();
        {
            let mut inner = self.lock();
            let entry = inner
                .operations
                .get(operation_id)
                .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))?;
            if entry.operation.status.is_terminal() {
                tracing::debug!(
                    operation_id = %operation_id,
                    status = %entry.operation.status,
                    "operation_cancel_skipped"
                );
                return Ok(false);
            }

            let mut order = Vec::new();
            inner.running_descendants(operation_id, &mut order);
            order.push(operation_id.to_string());

            for id in order {
                let Some(entry) = inner.operations.get_mut(&id) else {
                    continue;
                };
                let reason = if id == operation_id {
                    reason
                } else {
                    PARENT_CANCELLED_REASON
                };
                entry.abort.cancel();
                if entry.operation.op_type == OperationType::AgentRun {
                    entry.operation.metadata.is_aborting = true;
                }
                entry.operation.status = OperationStatus::Cancelled;
                entry.operation.metadata.finish_at(now);
                entry.operation.metadata.cancel_reason = Some(reason.to_string());
                tracing::debug!(
                    operation_id = %id,
                    op_type = %entry.operation.op_type,
                    reason = %reason,
                    "operation_cancelled"
                );
                if let Some(handler) = entry.cancel_handler.take() {
                    handlers.push((
                        handler,
                        CancelContext {
                            operation_id: id.clone(),
                            op_type: entry.operation.op_type,
                            reason: reason.to_string(),
                            metadata: entry.operation.metadata.clone(),
                        },
                    ));
                }
            }
        }

        for (handler, context) in handlers {
            let operation_id = context.operation_id.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(context))).is_err() {
                tracing::warn!(operation_id = %operation_id, "operation_cancel_handler_panicked");
            }
        }
        Ok(true)
    }

    /// Registers the handler run when the operation is cancelled. Returns
    /// false when the operation is unknown or already terminal.
    pub fn on_operation_cancel<F>(&self, operation_id: &str, handler: F) -> bool
    where
        F: FnOnce(CancelContext) + Send + 'static,
    {
        let mut inner = self.lock();
        match inner.operations.get_mut(operation_id) {
            Some(entry) if entry.operation.status == OperationStatus::Running => {
                entry.cancel_handler = Some(Box::new(handler));
                true
            }
            _ => {
                tracing::warn!(operation_id = %operation_id, "operation_cancel_handler_not_registered");
                false
            }
        }
    }

    /// Cancels every running operation matching `filter`; returns the ids
    /// that matched.
    pub fn cancel_operations(&self, filter: &OperationFilter, reason: &str) -> Vec<String> {
        let matched: Vec<String> = {
            let inner = self.lock();
            inner
                .operations
                .values()
                .filter(|entry| entry.operation.status == OperationStatus::Running)
                .filter(|entry| filter.matches(&entry.operation))
                .map(|entry| entry.operation.id.clone())
                .collect()
        };
        for operation_id in &matched {
            let _ = self.cancel_operation(operation_id, reason);
        }
        matched
    }

    pub fn cancel_all_operations(&self, reason: &str) -> usize {
        self.cancel_operations(&OperationFilter::default(), reason)
            .len()
    }

    /// Drops terminal operations whose end time is more than `max_age_ms` ago.
    pub fn cleanup_completed_operations(&self, max_age_ms: u64) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .operations
            .values()
            .filter(|entry| entry.operation.status.is_terminal())
            .filter(|entry| {
                entry.operation.metadata.end_time.is_some_and(|end_time| {
                    (now - end_time).num_milliseconds() > max_age_ms as i64
                })
            })
            .map(|entry| entry.operation.id.clone())
            .collect();
        for operation_id in &stale {
            inner.remove(operation_id);
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "operations_cleaned_up");
        }
        stale.len()
    }

    pub fn abort_signal(&self, operation_id: &str) -> Result<CancellationToken, OperationError> {
        self.lock()
            .operations
            .get(operation_id)
            .map(|entry| entry.abort.clone())
            .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))
    }

    pub fn update_operation_metadata(
        &self,
        operation_id: &str,
        patch: MetadataPatch,
    ) -> Result<(), OperationError> {
        let mut inner = self.lock();
        let entry = inner
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))?;
        patch.apply(&mut entry.operation.metadata);
        Ok(())
    }

    /// Records progress. Without `total` the previous total is kept, or
    /// `current` when there was none.
    pub fn update_operation_progress(
        &self,
        operation_id: &str,
        current: u64,
        total: Option<u64>,
    ) -> Result<(), OperationError> {
        let mut inner = self.lock();
        let entry = inner
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| OperationError::NotFound(operation_id.to_string()))?;
        let metadata = &mut entry.operation.metadata;
        let resolved_total = total
            .or_else(|| metadata.progress.as_ref().map(|progress| progress.total))
            .unwrap_or(current);
        let percentage = total
            .filter(|total| *total > 0)
            .map(|total| ((current as f64 / total as f64) * 100.0).round() as u8);
        metadata.progress = Some(OperationProgress {
            current,
            total: resolved_total,
            percentage,
        });
        Ok(())
    }

    pub fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.lock().snapshot(operation_id)
    }

    pub fn operations_by_message(&self, message_id: &str) -> Vec<Operation> {
        let inner = self.lock();
        inner.snapshots(inner.by_message.get(message_id))
    }

    /// The most recently associated operation for a message.
    pub fn operation_for_message(&self, message_id: &str) -> Option<Operation> {
        let inner = self.lock();
        inner
            .message_operation
            .get(message_id)
            .and_then(|operation_id| inner.snapshot(operation_id))
    }

    pub fn operations_by_type(&self, op_type: OperationType) -> Vec<Operation> {
        let inner = self.lock();
        inner.snapshots(inner.by_type.get(&op_type))
    }

    pub fn operations_by_context(&self, session_id: &str, topic_id: Option<&str>) -> Vec<Operation> {
        let inner = self.lock();
        inner.snapshots(inner.by_context.get(&context_key(session_id, topic_id)))
    }

    pub fn running_operations(&self) -> Vec<Operation> {
        self.lock()
            .operations
            .values()
            .filter(|entry| entry.operation.status == OperationStatus::Running)
            .map(|entry| entry.operation.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_clock() -> (OperationRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
        (OperationRegistry::with_clock(clock.clone()), clock)
    }

    #[test]
    fn start_operation_inherits_parent_context_and_links_child() {
        let (registry, _) = registry_with_clock();
        let mut context = OperationContext::for_session("s1");
        context.topic_id = Some("t1".to_string());
        let parent = registry.start_operation(
            StartOperation::new(OperationType::AgentRun).context(context),
        );
        let child = registry.start_operation(
            StartOperation::new(OperationType::ToolCall)
                .context(OperationContext::default().with_message("m1"))
                .parent(Some(parent.operation_id.clone())),
        );

        let child_op = registry.operation(&child.operation_id).expect("child exists");
        assert_eq!(child_op.context.session_id.as_deref(), Some("s1"));
        assert_eq!(child_op.context.topic_id.as_deref(), Some("t1"));
        assert_eq!(child_op.context.message_id.as_deref(), Some("m1"));
        assert!(child_op.id.starts_with("op_"));

        let parent_op = registry.operation(&parent.operation_id).expect("parent exists");
        assert_eq!(parent_op.child_operation_ids, vec![child.operation_id.clone()]);
        assert_eq!(registry.operations_by_context("s1", Some("t1")).len(), 2);
        assert_eq!(registry.operations_by_type(OperationType::ToolCall).len(), 1);
    }

    #[test]
    fn complete_operation_second_call_is_noop_and_keeps_end_time() {
        let (registry, clock) = registry_with_clock();
        let handle = registry.start_operation(StartOperation::new(OperationType::ModelCall));
        clock.advance_ms(40);
        assert_eq!(registry.complete_operation(&handle.operation_id, None), Ok(true));
        let first = registry.operation(&handle.operation_id).expect("exists");

        clock.advance_ms(500);
        assert_eq!(registry.complete_operation(&handle.operation_id, None), Ok(false));
        assert_eq!(
            registry.fail_operation(&handle.operation_id, OperationFailure::new("x", "late")),
            Ok(false)
        );
        assert_eq!(
            registry.cancel_operation(&handle.operation_id, "late"),
            Ok(false)
        );
        let second = registry.operation(&handle.operation_id).expect("exists");

        assert_eq!(second.status, OperationStatus::Completed);
        assert_eq!(second.metadata.end_time, first.metadata.end_time);
        assert_eq!(second.metadata.duration_ms, Some(40));
        assert!(!handle.abort.is_cancelled());
    }

    #[test]
    fn unknown_operation_returns_not_found() {
        let registry = OperationRegistry::new();
        assert_eq!(
            registry.complete_operation("op_missing", None),
            Err(OperationError::NotFound("op_missing".to_string()))
        );
        assert!(registry.abort_signal("op_missing").is_err());
        assert!(!registry.on_operation_cancel("op_missing", |_| {}));
    }

    #[test]
    fn update_operation_progress_computes_percentage_and_keeps_total() {
        let registry = OperationRegistry::new();
        let handle = registry.start_operation(StartOperation::new(OperationType::ToolCall));
        registry
            .update_operation_progress(&handle.operation_id, 1, Some(4))
            .expect("progress should update");
        registry
            .update_operation_progress(&handle.operation_id, 3, None)
            .expect("progress should update");

        let progress = registry
            .operation(&handle.operation_id)
            .and_then(|operation| operation.metadata.progress)
            .expect("progress recorded");
        assert_eq!(progress.current, 3);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.percentage, None);
    }

    #[test]
    fn cleanup_removes_old_terminal_operations_and_indexes() {
        let (registry, clock) = registry_with_clock();
        let old = registry.start_operation(
            StartOperation::new(OperationType::ToolCall)
                .context(OperationContext::for_session("s1").with_message("m1")),
        );
        registry
            .complete_operation(&old.operation_id, None)
            .expect("complete");
        let running = registry.start_operation(StartOperation::new(OperationType::ModelCall));

        clock.advance_ms(31_000);
        assert_eq!(registry.cleanup_completed_operations(30_000), 1);
        assert!(registry.operation(&old.operation_id).is_none());
        assert!(registry.operations_by_message("m1").is_empty());
        assert!(registry.operation_for_message("m1").is_none());
        assert!(registry.operation(&running.operation_id).is_some());
    }

    #[test]
    fn cleanup_prunes_explicit_message_links_and_empty_index_keys() {
        let (registry, clock) = registry_with_clock();
        let handle = registry.start_operation(
            StartOperation::new(OperationType::ToolCall)
                .context(OperationContext::for_session("s1").with_message("assistant")),
        );
        registry
            .associate_message_with_operation("tool_msg", &handle.operation_id)
            .expect("association should succeed");
        registry
            .complete_operation(&handle.operation_id, None)
            .expect("complete");

        clock.advance_ms(31_000);
        assert_eq!(registry.cleanup_completed_operations(30_000), 1);

        let inner = registry.lock();
        assert!(inner.operations.is_empty());
        assert!(inner.by_message.is_empty(), "message index should be empty");
        assert!(inner.message_operation.is_empty());
        assert!(inner.by_type.is_empty());
        assert!(inner.by_context.is_empty());
    }

    #[test]
    fn starting_top_level_operation_cleans_up_expired_ones() {
        let (registry, clock) = registry_with_clock();
        let old = registry.start_operation(StartOperation::new(OperationType::ToolCall));
        registry
            .cancel_operation(&old.operation_id, "stop")
            .expect("cancel");
        clock.advance_ms(DEFAULT_COMPLETED_RETENTION_MS as i64 + 1);

        registry.start_operation(StartOperation::new(OperationType::AgentRun));
        assert!(registry.operation(&old.operation_id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cancel_handler_panic_is_contained() {
        let registry = OperationRegistry::new();
        let handle = registry.start_operation(StartOperation::new(OperationType::ToolCall));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        assert!(registry.on_operation_cancel(&handle.operation_id, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("handler failure");
        }));

        assert_eq!(registry.cancel_operation(&handle.operation_id, "stop"), Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.operation(&handle.operation_id).map(|op| op.status),
            Some(OperationStatus::Cancelled)
        );
    }
}
