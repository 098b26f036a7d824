use runloop_ops::{
    OperationContext, OperationFilter, OperationRegistry, OperationStatus, OperationType,
    PARENT_CANCELLED_REASON, StartOperation,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn concurrent_cancel_fires_abort_and_handler_exactly_once() {
    let registry = OperationRegistry::new();
    let handle = registry.start_operation(StartOperation::new(OperationType::ToolCall));
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let seen = handler_calls.clone();
    registry.on_operation_cancel(&handle.operation_id, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let wins = Arc::new(AtomicUsize::new(0));
    thread::scope(|scope| {
        for _ in 0..2 {
            let registry = registry.clone();
            let operation_id = handle.operation_id.clone();
            let wins = wins.clone();
            scope.spawn(move || {
                if registry
                    .cancel_operation(&operation_id, "User cancelled")
                    .expect("operation should exist")
                {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
    assert!(handle.abort.is_cancelled());
    let operation = registry
        .operation(&handle.operation_id)
        .expect("operation should exist");
    assert_eq!(operation.status, OperationStatus::Cancelled);
    assert_eq!(operation.metadata.cancel_reason.as_deref(), Some("User cancelled"));
}

#[test]
fn start_operation_with_message_links_once_even_when_associated_again() {
    let registry = OperationRegistry::new();
    let handle = registry.start_operation(
        StartOperation::new(OperationType::ToolCall)
            .context(OperationContext::default().with_message("m1")),
    );

    registry
        .associate_message_with_operation("m1", &handle.operation_id)
        .expect("association should succeed");

    let linked = registry.operations_by_message("m1");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].id, handle.operation_id);
    assert_eq!(
        registry.operation_for_message("m1").map(|operation| operation.id),
        Some(handle.operation_id)
    );
}

#[test]
fn cancel_cascades_deepest_first_with_one_abort_per_operation() {
    let registry = OperationRegistry::new();
    let root = registry.start_operation(
        StartOperation::new(OperationType::AgentRun).context(OperationContext::for_session("s1")),
    );
    let model = registry.start_operation(
        StartOperation::new(OperationType::ModelCall).parent(Some(root.operation_id.clone())),
    );
    let tool = registry.start_operation(
        StartOperation::new(OperationType::ToolCall).parent(Some(model.operation_id.clone())),
    );
    let finished = registry.start_operation(
        StartOperation::new(OperationType::CreateMessage).parent(Some(root.operation_id.clone())),
    );
    registry
        .complete_operation(&finished.operation_id, None)
        .expect("complete");

    let order = Arc::new(Mutex::new(Vec::new()));
    for handle in [&root, &model, &tool] {
        let order = order.clone();
        registry.on_operation_cancel(&handle.operation_id, move |context| {
            order
                .lock()
                .expect("order mutex should lock")
                .push(context.operation_id);
        });
    }

    assert_eq!(registry.cancel_operation(&root.operation_id, "stop"), Ok(true));

    let order = order.lock().expect("order mutex should lock").clone();
    assert_eq!(
        order,
        vec![
            tool.operation_id.clone(),
            model.operation_id.clone(),
            root.operation_id.clone()
        ]
    );
    for handle in [&root, &model, &tool] {
        assert!(handle.abort.is_cancelled());
        assert_eq!(
            registry.operation(&handle.operation_id).map(|op| op.status),
            Some(OperationStatus::Cancelled)
        );
    }
    let tool_op = registry.operation(&tool.operation_id).expect("tool exists");
    assert_eq!(
        tool_op.metadata.cancel_reason.as_deref(),
        Some(PARENT_CANCELLED_REASON)
    );
    let root_op = registry.operation(&root.operation_id).expect("root exists");
    assert!(root_op.metadata.is_aborting);
    assert_eq!(
        registry.operation(&finished.operation_id).map(|op| op.status),
        Some(OperationStatus::Completed)
    );
    assert!(!finished.abort.is_cancelled());
}

#[test]
fn cancel_operations_by_session_leaves_other_sessions_running() {
    let registry = OperationRegistry::new();
    let mine = registry.start_operation(
        StartOperation::new(OperationType::ToolCall).context(OperationContext::for_session("s1")),
    );
    let theirs = registry.start_operation(
        StartOperation::new(OperationType::ToolCall).context(OperationContext::for_session("s2")),
    );

    let cancelled = registry.cancel_operations(&OperationFilter::session("s1"), "batch");
    assert_eq!(cancelled, vec![mine.operation_id.clone()]);
    assert!(mine.abort.is_cancelled());
    assert!(!theirs.abort.is_cancelled());

    assert_eq!(registry.cancel_all_operations("shutdown"), 1);
    assert!(theirs.abort.is_cancelled());
    assert!(registry.running_operations().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn abort_signal_wakes_waiting_task_on_cancel() {
    let registry = OperationRegistry::new();
    let handle = registry.start_operation(StartOperation::new(OperationType::ModelCall));
    let signal = registry
        .abort_signal(&handle.operation_id)
        .expect("abort signal should exist");

    let waiter = tokio::spawn(async move {
        signal.cancelled().await;
        "aborted"
    });
    registry
        .cancel_operation(&handle.operation_id, "stop")
        .expect("cancel should succeed");

    assert_eq!(waiter.await.expect("waiter should join"), "aborted");
}
