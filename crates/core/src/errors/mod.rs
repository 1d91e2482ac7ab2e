//! 错误类型模块
//!
//! ## 模块结构
//! - `attempt`: 单次尝试失败（AttemptFailure），调度器内部使用
//! - `dispatch_error`: 调度终态错误（DispatchError）
//! - `config_error`: 配置写入时的校验错误（ConfigError）

mod attempt;
mod config_error;
mod dispatch_error;

pub use attempt::{AttemptFailure, FailureKind};
pub use config_error::ConfigError;
pub use dispatch_error::{DispatchError, DispatchErrorCode};
