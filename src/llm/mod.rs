//! 生成层：后端抽象与实现（OpenAI 兼容 SSE / Scripted），以及工具 / 模型路由

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::ScriptedGenerator;
pub use openai::OpenAiCompatGenerator;
pub use router::{ActionTool, ModelProfile, ReasoningDepth, RoutingDecision, ToolRouter};
pub use traits::{find_stop, ChunkStream, GenerationRequest, Generator, LlmError};
