//! 工具层：shell、沙箱文件写入、人工确认、动作执行器与写入后的项目检查

pub mod confirm;
pub mod executor;
pub mod filesystem;
pub mod shell;
pub mod validator;

pub use confirm::{ConfirmationGate, StaticConfirm, StdinConfirm};
pub use executor::{ActionExecutor, TIMEOUT_MARKER};
pub use filesystem::{FileWriter, SafeFs, WriteStatus};
pub use shell::{LocalShell, ShellOutput, ShellRunner};
pub use validator::{ProjectKind, ProjectValidator};
