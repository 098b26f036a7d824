mod script;

use clap::{ArgAction, Parser, Subcommand};
use runloop_agent::{
    AgentRunner, ExecutorContext, GeneralPlanner, MemoryMessagePersistence,
    OptimisticMessageStore, Planner, RunEvent, RunEventBus, RunOutcome, RunnerConfig,
    ScriptedModelProvider, ScriptedPlanner, ToolRegistry,
};
use runloop_state::{
    AgentRunState, Clock, HumanResponse, RunCheckpoint, RunStatus, SystemClock, finish_reason,
};
use script::{RunScript, parse_human_answer};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "runloop")]
#[command(about = "In-process host that replays scripted agent runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    InspectCheckpoint(InspectCheckpointArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, env = "RUNLOOP_SCRIPT")]
    script: PathBuf,
    /// Written after every step.
    #[arg(long, env = "RUNLOOP_CHECKPOINT")]
    checkpoint: Option<PathBuf>,
    #[arg(long, env = "RUNLOOP_MAX_STEPS")]
    max_steps: Option<u32>,
    /// Answers for human requests, used in order: approve, reject[:reason],
    /// prompt:<text>, select:<values>.
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    /// Supplies tools and the remaining model responses; its instructions
    /// are ignored.
    #[arg(long, env = "RUNLOOP_SCRIPT")]
    script: PathBuf,
    #[arg(long, env = "RUNLOOP_CHECKPOINT")]
    checkpoint: PathBuf,
    #[arg(long, env = "RUNLOOP_MAX_STEPS")]
    max_steps: Option<u32>,
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Everything a run needs besides its state.
struct Host {
    runner: AgentRunner,
    store: OptimisticMessageStore,
    clock: Arc<dyn Clock>,
    event_task: tokio::task::JoinHandle<()>,
}

impl Host {
    fn build(
        script: &RunScript,
        checkpoint: Option<PathBuf>,
        max_steps: Option<u32>,
        event_json: bool,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = OptimisticMessageStore::new(
            Arc::new(MemoryMessagePersistence::new()),
            Arc::clone(&clock),
        );
        let mut tools = ToolRegistry::new();
        for tool in script.registered_tools() {
            tools.register(tool);
        }

        let defaults = RunnerConfig::default();
        let config = RunnerConfig {
            max_steps: max_steps.or(script.max_steps).unwrap_or(defaults.max_steps),
            tool_pricing: script.tool_pricing.clone(),
            approval_required_tools: script.approval_required.iter().cloned().collect(),
            checkpoint_path: checkpoint,
            default_model: script.model.clone(),
            ..defaults
        };

        let mut context = ExecutorContext::new(
            Arc::new(store.clone()),
            Arc::new(tools),
            Arc::clone(&clock),
        )
        .with_config(config);
        let planner: Arc<dyn Planner> = match script.model.clone() {
            Some(model) => {
                context = context.with_model(Arc::new(ScriptedModelProvider::new(
                    script.model_responses.clone(),
                )));
                Arc::new(
                    GeneralPlanner::new(Some(model))
                        .require_approval_for(script.approval_required.iter().cloned()),
                )
            }
            None => Arc::new(ScriptedPlanner::default()),
        };

        let events = RunEventBus::new();
        let mut receiver = events.subscribe();
        let event_task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                print_event(&event, event_json);
            }
        });
        let runner = AgentRunner::new(context, planner).with_events(events);
        Self {
            runner,
            store,
            clock,
            event_task,
        }
    }

    /// Drops the runner so the event stream drains, then flushes the store.
    async fn shutdown(self) -> Result<(), String> {
        let Self {
            runner,
            store,
            event_task,
            ..
        } = self;
        drop(runner);
        event_task.await.map_err(|error| error.to_string())?;
        store.flush().await;
        Ok(())
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let script = RunScript::load(&args.script)?;
    let answers = parse_answers(&args.human_answers)?;
    let host = Host::build(&script, args.checkpoint, args.max_steps, args.event_json);

    let mut state = AgentRunState::new(script.session_id.clone(), host.clock.now());
    if let Some(cost_limit) = script.cost_limit.clone() {
        state = state.with_cost_limit(cost_limit);
    }
    tracing::info!(
        session_id = %state.session_id,
        queued = script.instructions.len(),
        "cli_run_started"
    );

    let outcome = host
        .runner
        .run_with_queue(state, script.instructions.clone())
        .await
        .map_err(|error| error.to_string())?;
    let outcome = answer_pending(&host.runner, outcome, answers)
        .await
        .map_err(|error| error.to_string())?;

    host.shutdown().await?;
    print_outcome(&outcome);
    Ok(exit_code_for_outcome(&outcome))
}

/// Answers successive human requests with `answers`, in order. The run stays
/// paused once they run out.
async fn answer_pending(
    runner: &AgentRunner,
    mut outcome: RunOutcome,
    answers: impl IntoIterator<Item = HumanResponse>,
) -> Result<RunOutcome, runloop_agent::AgentError> {
    for answer in answers {
        outcome = match outcome {
            RunOutcome::WaitingForHuman { state, pending, .. } => {
                runner
                    .resume_with_human_response(state, answer, pending)
                    .await?
            }
            finished => return Ok(finished),
        };
    }
    Ok(outcome)
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, String> {
    let script = RunScript::load(&args.script)?;
    let answers = parse_answers(&args.human_answers)?;
    let checkpoint =
        RunCheckpoint::load_from_path(&args.checkpoint).map_err(|error| error.to_string())?;
    if checkpoint.state.is_terminal() {
        return Err(format!(
            "checkpoint '{}' holds a finished run ({})",
            args.checkpoint.display(),
            checkpoint.state.status
        ));
    }

    let host = Host::build(
        &script,
        Some(args.checkpoint.clone()),
        args.max_steps,
        args.event_json,
    );
    let RunCheckpoint {
        state,
        pending_instructions,
        ..
    } = checkpoint;
    host.store.hydrate(&state.session_id, state.messages.clone());
    tracing::info!(
        session_id = %state.session_id,
        status = %state.status,
        step = state.step_count,
        "cli_resume_started"
    );

    let mut answers = answers.into_iter();
    let outcome = match state.status {
        RunStatus::WaitingForHuman => {
            let Some(answer) = answers.next() else {
                return Err("run is waiting for a human; pass --human-answer".to_string());
            };
            host.runner
                .resume_with_human_response(state, answer, pending_instructions)
                .await
        }
        _ => host.runner.run_with_queue(state, pending_instructions).await,
    }
    .map_err(|error| error.to_string())?;
    let outcome = answer_pending(&host.runner, outcome, answers)
        .await
        .map_err(|error| error.to_string())?;

    host.shutdown().await?;
    print_outcome(&outcome);
    Ok(exit_code_for_outcome(&outcome))
}

fn inspect_checkpoint_command(args: InspectCheckpointArgs) -> Result<ExitCode, String> {
    let checkpoint =
        RunCheckpoint::load_from_path(&args.checkpoint).map_err(|e| e.to_string())?;
    if args.json {
        let json = serde_json::to_string_pretty(&checkpoint).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    let state = &checkpoint.state;
    println!("checkpoint: {}", args.checkpoint.display());
    println!("schema_version: {}", checkpoint.metadata.schema_version);
    println!("session_id: {}", checkpoint.metadata.session_id);
    println!("saved_at: {}", checkpoint.metadata.saved_at);
    println!("status: {}", state.status);
    println!("step_count: {}", state.step_count);
    println!("messages: {}", state.messages.len());
    println!("pending_instructions: {}", checkpoint.pending_instructions.len());
    println!("cost: {:.4} {}", state.cost.total, state.cost.currency);
    if let Some(pending) = state.pending_human.as_ref() {
        println!(
            "waiting_for: {}",
            pending.request.interaction_kind().as_str()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_answers(raw: &[String]) -> Result<Vec<HumanResponse>, String> {
    raw.iter().map(|answer| parse_human_answer(answer)).collect()
}

fn print_event(event: &RunEvent, event_json: bool) {
    if event_json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
            return;
        }
    }
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event.event.kind()
    );
}

fn print_outcome(outcome: &RunOutcome) {
    let state = outcome.state();
    println!("session_id: {}", state.session_id);
    println!("status: {}", state.status);
    match outcome {
        RunOutcome::Finished {
            reason,
            reason_detail,
            ..
        } => {
            println!("reason: {reason}");
            if let Some(detail) = reason_detail.as_deref() {
                println!("reason_detail: {detail}");
            }
        }
        RunOutcome::WaitingForHuman { request, .. } => {
            println!("waiting_for: {}", request.interaction_kind().as_str());
        }
    }
    println!("step_count: {}", state.step_count);
    println!("messages: {}", state.messages.len());
    println!("cost: {:.4} {}", state.cost.total, state.cost.currency);
}

fn exit_code_for_outcome(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::WaitingForHuman { .. } => ExitCode::from(2),
        RunOutcome::Finished { reason, state, .. } => {
            if reason == finish_reason::COMPLETED {
                ExitCode::SUCCESS
            } else if reason == finish_reason::ERROR || state.status == RunStatus::Error {
                ExitCode::from(1)
            } else {
                ExitCode::from(3)
            }
        }
    }
}
