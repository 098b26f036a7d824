use crate::executors::{self, StepResult, carry_failed_turn, execute_finish};
use crate::retry::delay_for_attempt_ms;
use crate::{AgentError, ExecutorContext, Planner, RunEventBus, RunPhase};
use futures::FutureExt;
use runloop_ops::{MetadataPatch, OperationFilter, OperationRegistry, OperationType, StartOperation};
use runloop_state::{
    AgentEvent, AgentRunState, ErrorKind, FinishPayload, HumanRequest, HumanResponse,
    HumanResponsePayload, Instruction, ResolveAbortedToolsPayload, RunCheckpoint, RunStatus,
    finish_reason,
};
use serde_json::json;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

pub const USER_CANCELLED_DETAIL: &str = "Operation cancelled by user";

/// How a call into the runner ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Finished {
        state: AgentRunState,
        reason: String,
        reason_detail: Option<String>,
    },
    /// The run is parked on a human request. Resume it with
    /// [`AgentRunner::resume_with_human_response`], passing `pending` back.
    WaitingForHuman {
        state: AgentRunState,
        request: HumanRequest,
        pending: Vec<Instruction>,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &AgentRunState {
        match self {
            Self::Finished { state, .. } | Self::WaitingForHuman { state, .. } => state,
        }
    }

    pub fn into_state(self) -> AgentRunState {
        match self {
            Self::Finished { state, .. } | Self::WaitingForHuman { state, .. } => state,
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match self {
            Self::Finished { reason, .. } => Some(reason),
            Self::WaitingForHuman { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
struct ActiveRun {
    session_id: String,
    run_operation_id: String,
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    active: Mutex<Option<ActiveRun>>,
}

/// Cancels a runner from any task. Cancelling is idempotent and sticky: a
/// cancelled runner resolves open tool calls and finishes `user_cancelled`
/// at its next check, and stays cancelled.
#[derive(Clone)]
pub struct RunCancelHandle {
    inner: Arc<CancelState>,
    operations: OperationRegistry,
}

impl RunCancelHandle {
    fn new(operations: OperationRegistry) -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                active: Mutex::new(None),
            }),
            operations,
        }
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self
            .inner
            .active
            .lock()
            .expect("run cancel mutex poisoned")
            .clone();
        if let Some(active) = active {
            tracing::info!(
                session_id = %active.session_id,
                operation_id = %active.run_operation_id,
                "agent_run_cancel_requested"
            );
            if let Err(error) = self
                .operations
                .cancel_operation(&active.run_operation_id, USER_CANCELLED_DETAIL)
            {
                tracing::debug!(error = %error, "agent_run_operation_missing");
            }
            self.operations.cancel_operations(
                &OperationFilter::session(active.session_id),
                USER_CANCELLED_DETAIL,
            );
        }
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn activate(&self, session_id: &str, run_operation_id: &str) {
        *self.inner.active.lock().expect("run cancel mutex poisoned") = Some(ActiveRun {
            session_id: session_id.to_string(),
            run_operation_id: run_operation_id.to_string(),
        });
    }

    fn deactivate(&self) {
        *self.inner.active.lock().expect("run cancel mutex poisoned") = None;
    }

    async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

/// Drives one run: pulls instructions from the queue or the planner, applies
/// them one at a time, publishes their events and decides whether to go on,
/// pause for a human or stop.
pub struct AgentRunner {
    context: ExecutorContext,
    planner: Arc<dyn Planner>,
    events: RunEventBus,
    cancel: RunCancelHandle,
}

impl AgentRunner {
    pub fn new(context: ExecutorContext, planner: Arc<dyn Planner>) -> Self {
        let cancel = RunCancelHandle::new(context.operations.clone());
        Self {
            context,
            planner,
            events: RunEventBus::default(),
            cancel,
        }
    }

    pub fn with_events(mut self, events: RunEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }

    pub fn cancel_handle(&self) -> RunCancelHandle {
        self.cancel.clone()
    }

    pub async fn run(&self, state: AgentRunState) -> Result<RunOutcome, AgentError> {
        self.run_with_queue(state, Vec::new()).await
    }

    /// Runs `pending` first, then whatever the planner decides.
    pub async fn run_with_queue(
        &self,
        state: AgentRunState,
        pending: Vec<Instruction>,
    ) -> Result<RunOutcome, AgentError> {
        self.drive(state, pending.into(), None).await
    }

    /// Answers the open human request of a paused run and keeps going. A
    /// response that does not answer the request is rejected before anything
    /// is applied.
    pub async fn resume_with_human_response(
        &self,
        state: AgentRunState,
        response: HumanResponse,
        pending: Vec<Instruction>,
    ) -> Result<RunOutcome, AgentError> {
        let instruction = Instruction::HumanResponse(HumanResponsePayload { response });
        executors::validate(&instruction, &state)?;
        let mut queue: VecDeque<Instruction> = pending.into();
        queue.push_front(instruction);
        self.drive(state, queue, None).await
    }

    /// Like [`AgentRunner::run`], but waits on `responses` whenever the run
    /// needs a human instead of returning. Mismatched responses are reported
    /// as error events and ignored.
    pub async fn run_interactive(
        &self,
        state: AgentRunState,
        responses: &mut mpsc::Receiver<HumanResponse>,
    ) -> Result<RunOutcome, AgentError> {
        self.drive(state, VecDeque::new(), Some(responses)).await
    }

    /// Applies one instruction with the runner's error policy: an executor
    /// error or panic becomes an `error` event plus `finish(error)`.
    pub async fn step(&self, state: &AgentRunState, instruction: &Instruction) -> StepResult {
        self.guarded_step(state, instruction, &self.context).await
    }

    async fn drive(
        &self,
        state: AgentRunState,
        mut queue: VecDeque<Instruction>,
        mut responses: Option<&mut mpsc::Receiver<HumanResponse>>,
    ) -> Result<RunOutcome, AgentError> {
        if state.is_terminal() {
            return Err(AgentError::InvalidState(format!(
                "run for session {} is already {}",
                state.session_id, state.status
            )));
        }

        let run_operation = self.context.operations.start_operation(
            StartOperation::new(OperationType::AgentRun)
                .context(self.context.operation_context(&state, None))
                .label("agent_run"),
        );
        let run_operation_id = run_operation.operation_id;
        self.cancel.activate(&state.session_id, &run_operation_id);
        let context = self
            .context
            .clone()
            .with_run_operation(Some(run_operation_id.clone()));
        tracing::info!(
            session_id = %state.session_id,
            operation_id = %run_operation_id,
            step = state.step_count,
            queued = queue.len(),
            "agent_run_started"
        );

        let mut state = state;
        let mut phase = match state.status {
            RunStatus::WaitingForHuman => RunPhase::WaitingForHuman,
            _ => RunPhase::Init,
        };
        let mut finished: Option<(String, Option<String>)> = None;
        let mut cancelling = false;

        loop {
            if state.is_terminal() {
                let (reason, reason_detail) = finished.take().unwrap_or_else(|| {
                    (
                        finish_reason::ERROR.to_string(),
                        Some("run ended without a finish instruction".to_string()),
                    )
                });
                self.close_run(&run_operation_id, json!(false));
                tracing::info!(
                    session_id = %state.session_id,
                    reason = %reason,
                    steps = state.step_count,
                    "agent_run_finished"
                );
                return Ok(RunOutcome::Finished {
                    state,
                    reason,
                    reason_detail,
                });
            }

            if self.cancel.is_cancelled() && !cancelling {
                cancelling = true;
                queue.clear();
                if let Some(resolve) = resolve_instruction(&state) {
                    queue.push_back(resolve);
                }
                queue.push_back(Instruction::finish(
                    finish_reason::USER_CANCELLED,
                    Some(USER_CANCELLED_DETAIL.to_string()),
                ));
            }

            if state.status == RunStatus::WaitingForHuman && !cancelling && !answers_waiting(&queue) {
                let Some(request) = state.pending_human.as_ref().map(|pending| pending.request.clone())
                else {
                    queue.push_front(Instruction::finish(
                        finish_reason::ERROR,
                        Some("run is waiting without a pending human request".to_string()),
                    ));
                    continue;
                };
                let Some(receiver) = responses.as_mut() else {
                    return Ok(self.pause(&run_operation_id, state, request, queue));
                };
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(response) => {
                            let instruction =
                                Instruction::HumanResponse(HumanResponsePayload { response });
                            match executors::validate(&instruction, &state) {
                                Ok(()) => queue.push_front(instruction),
                                Err(error) => {
                                    tracing::warn!(error = %error, "human_response_rejected");
                                    self.publish(
                                        &state.session_id,
                                        vec![AgentEvent::error(ErrorKind::Validation, error.to_string())],
                                    );
                                }
                            }
                        }
                        None => return Ok(self.pause(&run_operation_id, state, request, queue)),
                    },
                    _ = self.cancel.notified() => {}
                }
                continue;
            }

            let max_steps = context.config.max_steps;
            let instruction = if !cancelling && max_steps > 0 && state.step_count >= max_steps {
                Instruction::finish(
                    finish_reason::MAX_TURNS_REACHED,
                    Some(format!("Maximum steps exceeded: {max_steps}")),
                )
            } else {
                match queue.pop_front() {
                    Some(instruction) => instruction,
                    None => self.plan(&state, &phase, &mut queue),
                }
            };

            let result = self.guarded_step(&state, &instruction, &context).await;
            for event in &result.events {
                if let AgentEvent::Done {
                    reason,
                    reason_detail,
                    ..
                } = event
                {
                    finished = Some((reason.clone(), reason_detail.clone()));
                }
            }
            let StepResult {
                new_state,
                events,
                phase: next_phase,
                follow_ups,
            } = result;
            self.publish(&new_state.session_id, events);
            state = new_state;
            phase = next_phase;
            if !cancelling {
                for follow_up in follow_ups.into_iter().rev() {
                    queue.push_front(follow_up);
                }
            }
            self.write_checkpoint(&state, &queue);
        }
    }

    fn plan(
        &self,
        state: &AgentRunState,
        phase: &RunPhase,
        queue: &mut VecDeque<Instruction>,
    ) -> Instruction {
        let mut planned: VecDeque<Instruction> =
            self.planner.next_instructions(state, phase).into();
        match planned.pop_front() {
            Some(first) => {
                while let Some(next) = planned.pop_back() {
                    queue.push_front(next);
                }
                first
            }
            None => Instruction::finish(
                finish_reason::ERROR_RECOVERY,
                Some(format!(
                    "planner produced no instruction for phase {}",
                    phase.as_str()
                )),
            ),
        }
    }

    async fn guarded_step(
        &self,
        state: &AgentRunState,
        instruction: &Instruction,
        context: &ExecutorContext,
    ) -> StepResult {
        let attempt = AssertUnwindSafe(self.dispatch_with_retry(state, instruction, context))
            .catch_unwind()
            .await;
        let (failed_state, kind, message) = match attempt {
            Ok(Ok(result)) => return result,
            Ok(Err((failed_state, error))) => (failed_state, error.kind(), error.to_string()),
            Err(panic) => (
                state.clone(),
                ErrorKind::Internal,
                format!("executor panicked: {}", panic_message(panic.as_ref())),
            ),
        };
        tracing::warn!(
            session_id = %state.session_id,
            instruction = instruction.kind(),
            error = %message,
            "instruction_failed"
        );

        let payload = FinishPayload {
            reason: finish_reason::ERROR.to_string(),
            reason_detail: Some(message.clone()),
        };
        let mut result = execute_finish(&payload, &failed_state, context.clock.now());
        result.events.insert(0, AgentEvent::error(kind, message));
        result
    }

    /// Failed model turns are appended to the state before the next attempt,
    /// so the transcript matches the store. On error the returned state is the
    /// one the run should finish from.
    async fn dispatch_with_retry(
        &self,
        state: &AgentRunState,
        instruction: &Instruction,
        context: &ExecutorContext,
    ) -> Result<StepResult, (AgentRunState, AgentError)> {
        let policy = &context.config.model_retry;
        let mut current = state.clone();
        let mut attempt = 1;
        loop {
            let error = match executors::execute(instruction, &current, context).await {
                Ok(result) => return Ok(result),
                Err(AgentError::FailedTurn { message, source }) => {
                    current = carry_failed_turn(&current, *message, context.clock.now());
                    *source
                }
                Err(error) => error,
            };
            if !error.is_retryable() || !policy.should_retry(attempt) || self.cancel.is_cancelled()
            {
                return Err((current, error));
            }
            let seed = self.events.last_sequence_no() ^ u64::from(state.step_count);
            let delay_ms = delay_for_attempt_ms(attempt, &policy.backoff, seed);
            tracing::warn!(
                session_id = %state.session_id,
                attempt,
                delay_ms,
                error = %error,
                "model_call_retrying"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            attempt += 1;
        }
    }

    fn pause(
        &self,
        run_operation_id: &str,
        state: AgentRunState,
        request: HumanRequest,
        queue: VecDeque<Instruction>,
    ) -> RunOutcome {
        self.close_run(run_operation_id, json!(true));
        tracing::info!(
            session_id = %state.session_id,
            steps = state.step_count,
            "agent_run_paused"
        );
        RunOutcome::WaitingForHuman {
            state,
            request,
            pending: queue.into(),
        }
    }

    fn close_run(&self, run_operation_id: &str, paused: serde_json::Value) {
        self.cancel.deactivate();
        if let Err(error) = self
            .context
            .operations
            .complete_operation(run_operation_id, Some(MetadataPatch::extra("paused", paused)))
        {
            tracing::debug!(error = %error, "agent_run_operation_missing");
        }
    }

    fn publish(&self, session_id: &str, events: Vec<AgentEvent>) {
        if events.is_empty() {
            return;
        }
        self.events
            .publish(session_id, &self.context.now_timestamp(), events);
    }

    fn write_checkpoint(&self, state: &AgentRunState, queue: &VecDeque<Instruction>) {
        let Some(path) = self.context.config.checkpoint_path.as_ref() else {
            return;
        };
        let checkpoint = RunCheckpoint::new(state.clone(), queue.iter().cloned().collect());
        if let Err(error) = checkpoint.save_to_path(path) {
            tracing::warn!(
                session_id = %state.session_id,
                path = %path.display(),
                error = %error,
                "checkpoint_write_failed"
            );
        }
    }
}

/// Queue already holds something that may be applied while waiting.
fn answers_waiting(queue: &VecDeque<Instruction>) -> bool {
    matches!(
        queue.front(),
        Some(
            Instruction::HumanResponse(_)
                | Instruction::ResolveAbortedTools(_)
                | Instruction::Finish(_)
        )
    )
}

fn resolve_instruction(state: &AgentRunState) -> Option<Instruction> {
    let tool_calls = state.unresolved_tool_calls();
    if tool_calls.is_empty() {
        return None;
    }
    let parent_message_id = state
        .last_assistant_message()
        .map(|message| message.id.clone())
        .unwrap_or_default();
    Some(Instruction::ResolveAbortedTools(ResolveAbortedToolsPayload {
        tool_calls,
        parent_message_id,
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
