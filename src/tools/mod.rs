//! 工具层：能力声明、注册表、分发器与参考工具实现

pub mod analyze;
pub mod capability;
pub mod dispatcher;
pub mod filesystem;
pub mod generate;
pub mod registry;
pub mod search;
pub mod shell;

pub use analyze::AnalyzeCodeTool;
pub use capability::{ParamSpec, ParamType, ParameterSchema, ToolCapability, ToolKind};
pub use dispatcher::ToolDispatcher;
pub use filesystem::{ReadFileTool, SafeFs, WriteFileTool};
pub use generate::GenerateTool;
pub use registry::{CapabilityRegistry, InvocationContext, Tool};
pub use search::{FileSearchTool, SearchCodeTool};
pub use shell::ExecuteCommandTool;
