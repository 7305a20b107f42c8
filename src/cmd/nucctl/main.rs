use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use nucleus::internal::{
    config::KernelConfig,
    contract::validate::{check_contracts, validate, SchemaId},
    kernel::{Kernel, PlanPreview, RunOptions},
    plan::intent::{Intent, Scope},
    policy::policy::PolicyEngine,
    trace::{
        replay::{load_trace, run_ids, Replayer},
        trace::{decode_public_key, TraceKind},
    },
};
use serde_json::Value;
use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

#[derive(Parser)]
#[command(name = "nucctl")]
#[command(about = "Nucleus execution kernel CLI", long_about = None)]
struct Cli {
    /// Kernel config file (defaults to $NUCLEUS_CONFIG or config/kernel.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, plan and execute an intent
    RunIntent {
        #[command(flatten)]
        intent: IntentArgs,

        /// Permit destructive tools for this run
        #[arg(long)]
        allow_destructive: bool,

        /// Confirm risk-gated plans without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Plan and execute an intent without side effects
    DryRunIntent {
        #[command(flatten)]
        intent: IntentArgs,
    },
    /// Execute a complete plan JSON file
    RunPlan {
        #[command(flatten)]
        plan: PlanArgs,

        /// Permit destructive tools for this run
        #[arg(long)]
        allow_destructive: bool,

        /// Confirm risk-gated plans without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Execute a complete plan JSON file without side effects
    DryRunPlan {
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Print trace events
    ShowTrace {
        #[arg(long)]
        trace: Option<PathBuf>,

        #[arg(long)]
        run_id: Option<String>,

        /// Only events of this kind (e.g. policy_decision)
        #[arg(long)]
        kind: Option<String>,

        /// Only the last N events
        #[arg(long)]
        tail: Option<usize>,

        #[arg(long)]
        pretty: bool,
    },
    /// Re-evaluate recorded decisions and check trace integrity
    Replay {
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Replay a single run (defaults to every run in the trace)
        #[arg(long)]
        run_id: Option<String>,

        /// Base64 Ed25519 public key to verify signatures with
        #[arg(long)]
        public_key: Option<String>,
    },
    /// List registered tools
    ListTools,
    /// List intents declared by processing units
    ListIntents {
        #[arg(long)]
        units_dir: Option<PathBuf>,
    },
    /// Check embedded contracts, or validate a file against one
    CheckContract {
        /// Contract name (intent, plan, tool, trace_event, unit_manifest)
        schema: Option<String>,

        /// JSON file to validate
        file: Option<PathBuf>,
    },
}

#[derive(Args)]
struct IntentArgs {
    /// Intent JSON file
    #[arg(long, conflicts_with = "intent")]
    intent_file: Option<PathBuf>,

    /// Intent id, assembled with --param and --scope-root
    #[arg(long, required_unless_present = "intent_file")]
    intent: Option<String>,

    /// Intent parameter as key=value; values parse as JSON when they can
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Filesystem root the intent is scoped to
    #[arg(long = "scope-root", required_unless_present = "intent_file")]
    scope_roots: Vec<String>,

    /// Network host the intent may reach; enables network scope
    #[arg(long = "network-host")]
    network_hosts: Vec<String>,

    #[arg(long)]
    run_id: Option<String>,

    /// Trace file override
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    /// Plan JSON file; it must declare its own scope
    #[arg(long)]
    plan: PathBuf,

    #[arg(long)]
    run_id: Option<String>,

    /// Trace file override
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Clone, Copy)]
enum Source {
    Intent,
    Plan,
}

struct Launch {
    source: Source,
    payload: Value,
    run_id: Option<String>,
    trace: Option<PathBuf>,
    dry_run: bool,
    allow_destructive: bool,
    yes: bool,
}

impl IntentArgs {
    fn payload(&self) -> anyhow::Result<Value> {
        if let Some(path) = &self.intent_file {
            return read_json(path);
        }
        let intent_id = self
            .intent
            .clone()
            .ok_or_else(|| anyhow!("--intent or --intent-file is required"))?;
        let mut scope = Scope::fs(self.scope_roots.iter().cloned());
        if !self.network_hosts.is_empty() {
            scope = scope.with_network(self.network_hosts.iter().cloned());
        }
        let mut intent = Intent::new(intent_id, scope);
        for param in &self.params {
            let (key, raw) = param
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid --param '{}', expected KEY=VALUE", param))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            intent = intent.with_param(key, value);
        }
        Ok(intent.to_value())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nucleus=warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => KernelConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => KernelConfig::load(),
    };

    match cli.command {
        Commands::RunIntent {
            intent,
            allow_destructive,
            yes,
        } => {
            let launch = Launch {
                source: Source::Intent,
                payload: intent.payload()?,
                run_id: intent.run_id,
                trace: intent.trace,
                dry_run: false,
                allow_destructive,
                yes,
            };
            execute(config, launch).await
        }
        Commands::DryRunIntent { intent } => {
            let launch = Launch {
                source: Source::Intent,
                payload: intent.payload()?,
                run_id: intent.run_id,
                trace: intent.trace,
                dry_run: true,
                allow_destructive: false,
                yes: false,
            };
            execute(config, launch).await
        }
        Commands::RunPlan {
            plan,
            allow_destructive,
            yes,
        } => {
            let launch = Launch {
                source: Source::Plan,
                payload: read_json(&plan.plan)?,
                run_id: plan.run_id,
                trace: plan.trace,
                dry_run: false,
                allow_destructive,
                yes,
            };
            execute(config, launch).await
        }
        Commands::DryRunPlan { plan } => {
            let launch = Launch {
                source: Source::Plan,
                payload: read_json(&plan.plan)?,
                run_id: plan.run_id,
                trace: plan.trace,
                dry_run: true,
                allow_destructive: false,
                yes: false,
            };
            execute(config, launch).await
        }
        Commands::ShowTrace {
            trace,
            run_id,
            kind,
            tail,
            pretty,
        } => show_trace(
            trace.as_deref().unwrap_or(config.trace_path.as_path()),
            run_id.as_deref(),
            kind.as_deref(),
            tail,
            pretty,
        ),
        Commands::Replay {
            trace,
            run_id,
            public_key,
        } => replay(
            &config,
            trace.as_deref().unwrap_or(config.trace_path.as_path()),
            run_id.as_deref(),
            public_key.as_deref(),
        ),
        Commands::ListTools => list_tools(&config),
        Commands::ListIntents { units_dir } => {
            let mut config = config;
            if let Some(dir) = units_dir {
                config.units_dir = dir;
            }
            list_intents(&config)
        }
        Commands::CheckContract { schema, file } => check_contract(schema.as_deref(), file.as_deref()),
    }
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(mut config: KernelConfig, launch: Launch) -> anyhow::Result<ExitCode> {
    if let Some(trace) = launch.trace {
        config.trace_path = trace;
    }
    let kernel = Kernel::from_config(&config)?;
    let options = RunOptions {
        run_id: launch.run_id,
        dry_run: launch.dry_run,
        allow_destructive: launch.allow_destructive,
        confirmation_timeout: None,
    };
    let payload = launch.payload;

    // Failures here are recorded by the run itself.
    let preview = match launch.source {
        Source::Intent => kernel.preview(&payload, &options),
        Source::Plan => kernel.preview_plan(&payload, &options),
    }
    .ok();

    let handle = match launch.source {
        Source::Intent => kernel.start(payload, options)?,
        Source::Plan => kernel.start_plan(payload, options)?,
    };
    if let Some(preview) = preview.filter(|p| p.requires_confirmation) {
        let confirmed = launch.yes || prompt_confirmation(&preview)?;
        if confirmed {
            handle.confirm();
        } else {
            handle.reject();
        }
    }

    let run_id = handle.run_id().to_string();
    match handle.wait().await {
        Ok(report) => {
            print_json(&report)?;
            eprintln!("Trace written to {} (run {})", config.trace_path.display(), run_id);
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(e) => {
            eprintln!("Run {} failed: {}", run_id, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn prompt_confirmation(preview: &PlanPreview) -> anyhow::Result<bool> {
    eprintln!(
        "Plan {} ({:?} risk) requires confirmation:",
        preview.plan.plan_id, preview.plan.risk
    );
    for step in &preview.steps {
        eprintln!(
            "  [{}] {} {} -> {}",
            step.phase.as_str(),
            step.step_id,
            step.tool,
            step.decision.summary
        );
    }
    eprint!("Proceed with commit? [y/N] ");
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn show_trace(
    path: &Path,
    run_id: Option<&str>,
    kind: Option<&str>,
    tail: Option<usize>,
    pretty: bool,
) -> anyhow::Result<ExitCode> {
    let kind = kind
        .map(|k| {
            serde_json::from_value::<TraceKind>(Value::String(k.to_string()))
                .map_err(|_| anyhow!("Unknown event kind: {}", k))
        })
        .transpose()?;
    let events: Vec<_> = load_trace(path)?
        .into_iter()
        .filter(|e| run_id.map_or(true, |id| e.run_id == id))
        .filter(|e| kind.map_or(true, |k| e.kind == k))
        .collect();
    let skip = tail.map_or(0, |n| events.len().saturating_sub(n));

    for event in &events[skip..] {
        if pretty {
            println!("{}", serde_json::to_string_pretty(event)?);
        } else {
            println!("{}", serde_json::to_string(event)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn replay(
    config: &KernelConfig,
    path: &Path,
    run_id: Option<&str>,
    public_key: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let events = load_trace(path)?;
    let mut replayer = Replayer::new(PolicyEngine::new(config.policy.clone()));
    if let Some(encoded) = public_key {
        replayer = replayer.verify_with(decode_public_key(encoded)?);
    }

    let runs = match run_id {
        Some(id) => vec![id.to_string()],
        None => run_ids(&events),
    };
    if runs.is_empty() {
        bail!("No runs in {}", path.display());
    }

    let reports: Vec<_> = runs.iter().map(|id| replayer.replay(&events, id)).collect();
    print_json(&reports)?;
    Ok(if reports.iter().all(|r| r.is_consistent()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_tools(config: &KernelConfig) -> anyhow::Result<ExitCode> {
    let kernel = Kernel::from_config(config)?;
    print_json(&kernel.tools().descriptors())?;
    Ok(ExitCode::SUCCESS)
}

fn list_intents(config: &KernelConfig) -> anyhow::Result<ExitCode> {
    let kernel = Kernel::from_config(config)?;
    print_json(&kernel.units().list_intents())?;
    Ok(ExitCode::SUCCESS)
}

fn check_contract(schema: Option<&str>, file: Option<&Path>) -> anyhow::Result<ExitCode> {
    let (Some(schema), Some(file)) = (schema, file) else {
        let failures = check_contracts();
        for id in SchemaId::ALL {
            match failures.iter().find(|(failed, _)| *failed == id) {
                Some((_, reason)) => println!("{}: FAILED ({})", id, reason),
                None => println!("{}: ok", id),
            }
        }
        return Ok(if failures.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    };

    let id = SchemaId::parse(schema).ok_or_else(|| anyhow!("Unknown contract: {}", schema))?;
    let payload = read_json(file)?;
    match validate(&payload, id) {
        Ok(()) => {
            println!("{}: valid {}", file.display(), id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&e.to_value())?;
            Ok(ExitCode::FAILURE)
        }
    }
}
