//! 工具层：Capability 注册表、调用网关与内置工具（文件、git、命令、HTTP）

pub mod command;
pub mod filesystem;
pub mod gateway;
pub mod git;
pub mod registry;
pub mod web;

pub use command::CommandExecutor;
pub use filesystem::{FileOperations, SafeFs};
pub use gateway::{infer_tool, Invocation, ToolGateway, ToolOutcome};
pub use git::GitOperations;
pub use registry::{Capability, ToolRegistry};
pub use web::WebOperations;
