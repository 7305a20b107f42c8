//! Wires validation, compilation, execution and tracing together for adapters.

use crate::internal::{
    config::KernelConfig,
    contract::validate::{validate_intent, ValidationError},
    exec::executor::{ExecOptions, ExecutionError, Executor, RunReport, RunSignal, RunSignals},
    plan::{
        compiler::{CompileError, PlanCompiler},
        ir::{Phase, Plan},
    },
    policy::policy::{PlanContext, PolicyDecision, PolicyEngine, RunFlags},
    registry::{RegistryError, UnitRegistry},
    tools::{
        builtin::builtin_registry,
        registry::{ToolInvoker, ToolRegistry, ToolRegistryError},
    },
    trace::{
        store::{JsonlTraceStore, RunTrace, TraceEmitter, TraceStore},
        trace::{TraceError, TraceKind, TraceSigner},
    },
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Units(#[from] RegistryError),
    #[error(transparent)]
    Tools(#[from] ToolRegistryError),
    #[error("Run task failed: {0}")]
    Join(String),
}

impl KernelError {
    /// Trace write failures abort the run without a terminal event.
    pub fn is_trace_failure(&self) -> bool {
        match self {
            KernelError::Trace(e) | KernelError::Execution(ExecutionError::Trace(e)) => !matches!(
                e,
                TraceError::RunAlreadyOpen(_) | TraceError::RunIdTaken(_)
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub dry_run: bool,
    pub allow_destructive: bool,
    pub confirmation_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn allow_destructive(mut self) -> Self {
        self.allow_destructive = true;
        self
    }

    pub fn confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);
        self
    }
}

/// Sends signals to a spawned run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunSignaller {
    run_id: String,
    tx: mpsc::Sender<RunSignal>,
}

impl RunSignaller {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns false when the run is no longer listening.
    pub fn send(&self, signal: RunSignal) -> bool {
        self.tx.try_send(signal).is_ok()
    }

    pub fn confirm(&self) -> bool {
        self.send(RunSignal::Confirm)
    }

    pub fn reject(&self) -> bool {
        self.send(RunSignal::Reject)
    }

    pub fn cancel(&self) -> bool {
        self.send(RunSignal::Cancel)
    }
}

/// What a run would do, decided without executing anything.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub plan: Plan,
    pub decision: PolicyDecision,
    pub requires_confirmation: bool,
    pub steps: Vec<StepPreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepPreview {
    pub step_id: String,
    pub phase: Phase,
    pub tool: String,
    pub decision: PolicyDecision,
}

#[derive(Debug)]
pub struct RunHandle {
    signaller: RunSignaller,
    task: JoinHandle<Result<RunReport, KernelError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        self.signaller.run_id()
    }

    pub fn signaller(&self) -> RunSignaller {
        self.signaller.clone()
    }

    pub fn confirm(&self) -> bool {
        self.signaller.confirm()
    }

    pub fn reject(&self) -> bool {
        self.signaller.reject()
    }

    pub fn cancel(&self) -> bool {
        self.signaller.cancel()
    }

    pub async fn wait(self) -> Result<RunReport, KernelError> {
        self.task
            .await
            .map_err(|e| KernelError::Join(e.to_string()))?
    }
}

/// What a run starts from.
enum Submission {
    Intent(Value),
    Plan(Value),
}

#[derive(Debug, Clone)]
pub struct Kernel {
    units: Arc<UnitRegistry>,
    tools: Arc<ToolRegistry>,
    compiler: PlanCompiler,
    executor: Executor,
    emitter: TraceEmitter,
    confirmation_timeout: Duration,
}

impl Kernel {
    pub fn new(
        units: UnitRegistry,
        tools: ToolRegistry,
        store: Arc<dyn TraceStore>,
        config: &KernelConfig,
    ) -> Self {
        let units = Arc::new(units);
        let tools = Arc::new(tools);
        let invoker = ToolInvoker::new(tools.clone(), config.tool_timeout());
        Self {
            compiler: PlanCompiler::new(units.clone(), tools.clone()),
            executor: Executor::new(invoker, PolicyEngine::new(config.policy.clone())),
            emitter: TraceEmitter::new(store),
            confirmation_timeout: config.confirmation_timeout(),
            units,
            tools,
        }
    }

    /// Units from `units_dir`, the built-in tools and a JSONL trace at `trace_path`.
    pub fn from_config(config: &KernelConfig) -> Result<Self, KernelError> {
        let units = UnitRegistry::load_from_dir(&config.units_dir)?;
        let tools = builtin_registry()?;
        let store = Arc::new(JsonlTraceStore::open(&config.trace_path)?);
        let kernel = Self::new(units, tools, store, config);
        if config.sign_traces {
            let signer = Arc::new(TraceSigner::new());
            tracing::info!(public_key = %signer.public_key_base64(), "trace signing enabled");
            return Ok(kernel.with_signer(signer));
        }
        Ok(kernel)
    }

    pub fn with_signer(mut self, signer: Arc<TraceSigner>) -> Self {
        self.emitter = self.emitter.with_signer(signer);
        self
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn emitter(&self) -> &TraceEmitter {
        &self.emitter
    }

    pub fn policy(&self) -> &PolicyEngine {
        self.executor.policy()
    }

    /// Validates and compiles without executing or tracing anything.
    pub fn compile(&self, payload: &Value) -> Result<Plan, KernelError> {
        let intent = validate_intent(payload)?;
        Ok(self.compiler.compile(&intent)?)
    }

    /// Checks a complete plan without executing or tracing anything.
    pub fn admit_plan(&self, payload: &Value) -> Result<Plan, KernelError> {
        Ok(self.compiler.admit(payload)?)
    }

    /// Compiles `payload` and evaluates every decision the run would face.
    pub fn preview(&self, payload: &Value, options: &RunOptions) -> Result<PlanPreview, KernelError> {
        Ok(self.evaluate(self.compile(payload)?, options))
    }

    /// Like [`Kernel::preview`] for a complete plan.
    pub fn preview_plan(&self, payload: &Value, options: &RunOptions) -> Result<PlanPreview, KernelError> {
        Ok(self.evaluate(self.admit_plan(payload)?, options))
    }

    fn evaluate(&self, plan: Plan, options: &RunOptions) -> PlanPreview {
        let tools = self.executor.catalog(&plan);
        let ctx = PlanContext {
            plan: &plan,
            tools: &tools,
            flags: RunFlags {
                dry_run: options.dry_run,
                allow_destructive: options.allow_destructive,
            },
        };
        let plan_decision = self.policy().evaluate_plan(&ctx);
        let steps = plan
            .steps
            .iter()
            .map(|step| StepPreview {
                step_id: step.step_id.clone(),
                phase: step.phase,
                tool: step.tool.clone(),
                decision: self.policy().evaluate(step, &ctx),
            })
            .collect();
        PlanPreview {
            decision: plan_decision.decision,
            requires_confirmation: plan_decision.requires_confirmation
                && plan.steps_in(Phase::Commit).next().is_some(),
            steps,
            plan,
        }
    }

    /// Runs `payload` to a terminal state on the current task.
    pub async fn run(&self, payload: Value, options: RunOptions) -> Result<RunReport, KernelError> {
        let (trace, options) = self.open(options)?;
        self.drive(trace, Submission::Intent(payload), options, RunSignals::none())
            .await
    }

    /// Runs a complete plan, skipping intent routing but nothing else.
    pub async fn run_plan(&self, plan: Value, options: RunOptions) -> Result<RunReport, KernelError> {
        let (trace, options) = self.open(options)?;
        self.drive(trace, Submission::Plan(plan), options, RunSignals::none())
            .await
    }

    /// Spawns the run and returns a handle for signals and the final report.
    pub fn start(&self, payload: Value, options: RunOptions) -> Result<RunHandle, KernelError> {
        self.spawn(Submission::Intent(payload), options)
    }

    pub fn start_plan(&self, plan: Value, options: RunOptions) -> Result<RunHandle, KernelError> {
        self.spawn(Submission::Plan(plan), options)
    }

    fn spawn(&self, submission: Submission, options: RunOptions) -> Result<RunHandle, KernelError> {
        let (trace, options) = self.open(options)?;
        let (tx, rx) = mpsc::channel(8);
        let signaller = RunSignaller {
            run_id: trace.run_id().to_string(),
            tx,
        };
        let kernel = self.clone();
        let task = tokio::spawn(async move {
            kernel
                .drive(trace, submission, options, RunSignals::new(rx))
                .await
        });
        Ok(RunHandle { signaller, task })
    }

    fn open(&self, mut options: RunOptions) -> Result<(RunTrace, RunOptions), KernelError> {
        let run_id = options
            .run_id
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace = self.emitter.open(&run_id)?;
        Ok((trace, options))
    }

    async fn drive(
        &self,
        mut trace: RunTrace,
        submission: Submission,
        options: RunOptions,
        signals: RunSignals,
    ) -> Result<RunReport, KernelError> {
        let run_id = trace.run_id().to_string();
        let (key, payload) = match &submission {
            Submission::Intent(payload) => ("intent", payload),
            Submission::Plan(payload) => ("plan", payload),
        };
        trace.emit(
            TraceKind::IntentReceived,
            json!({
                key: payload,
                "dry_run": options.dry_run,
                "allow_destructive": options.allow_destructive,
            }),
        )?;

        let compiled = match &submission {
            Submission::Intent(payload) => match validate_intent(payload) {
                Ok(intent) => self.compiler.compile(&intent),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "intent rejected");
                    trace.emit(TraceKind::Error, e.to_value())?;
                    return Err(e.into());
                }
            },
            Submission::Plan(payload) => self.compiler.admit(payload),
        };
        let plan = match compiled {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "compilation failed");
                trace.emit(
                    TraceKind::Error,
                    json!({ "kind": "compile", "code": e.code(), "message": e.to_string() }),
                )?;
                return Err(e.into());
            }
        };

        let exec = ExecOptions {
            flags: RunFlags {
                dry_run: options.dry_run,
                allow_destructive: options.allow_destructive,
            },
            confirmation_timeout: options
                .confirmation_timeout
                .unwrap_or(self.confirmation_timeout),
        };
        Ok(self.executor.execute(&plan, &mut trace, exec, signals).await?)
    }
}
