// Kernel library entry point

pub mod internal {
    pub mod plan {
        pub mod compiler;
        pub mod intent;
        pub mod ir;
    }
    pub mod contract {
        pub mod validate;
    }
    pub mod tools {
        pub mod builtin;
        pub mod registry;
        pub mod spec;
    }
    pub mod exec {
        pub mod executor;
    }
    pub mod trace {
        pub mod replay;
        pub mod store;
        pub mod trace;
    }
    pub mod policy {
        pub mod policy;
        pub mod scope;
    }
    pub mod api;
    pub mod config;
    pub mod kernel;
    pub mod registry;
}

// Re-export key types for external use
pub use internal::config::KernelConfig;
pub use internal::contract::validate::{validate, SchemaId, ValidationError};
pub use internal::exec::executor::{
    ExecutionError, Executor, FailureReason, RunOutcome, RunReport, RunSignal, RunState,
};
pub use internal::kernel::{Kernel, KernelError, PlanPreview, RunHandle, RunOptions};
pub use internal::plan::compiler::{CompileError, PlanCompiler};
pub use internal::plan::intent::{Intent, IntentFlags, Scope};
pub use internal::plan::ir::{Phase, Plan, PlanValidationError, RiskLevel, Step};
pub use internal::policy::policy::{PolicyConfig, PolicyDecision, PolicyEngine, ReasonCode};
pub use internal::registry::{ProcessingUnit, UnitManifest, UnitRegistry};
pub use internal::tools::registry::{ToolInvoker, ToolRegistry};
pub use internal::tools::spec::{Tool, ToolDescriptor, ToolError};
pub use internal::trace::replay::{ReplayReport, Replayer};
pub use internal::trace::store::{JsonlTraceStore, MemoryTraceStore, TraceEmitter, TraceStore};
pub use internal::trace::trace::{TraceError, TraceEvent, TraceKind, TraceSigner};
