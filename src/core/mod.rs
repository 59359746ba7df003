//! 核心编排层：状态机、错误与恢复、置信度、指标、会话监管、关闭流程与 Cycle 控制器

pub mod builder;
pub mod confidence;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use builder::{create_controller, ControllerBuilder};
pub use confidence::{ConfidenceEngine, ConfidenceMetadata, FinalResult};
pub use error::{AgentError, ErrorKind};
pub use metrics::{MetricsTracker, RequestLog, RequestMetadata, TransitionRecord};
pub use orchestrator::{AgentCycleController, SessionSummary};
pub use recovery::{FallbackResult, RecoveryEngine, RetryPolicy};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{Cycle, CycleState, StateTracker};
