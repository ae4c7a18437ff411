pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod logger;
pub mod sandbox;

pub use error::{CodeletError, Result};
pub use executor::{
    DecodedValue, ExecutionResult, ExecutorBuilder, ExecutorState, RemoteExecutor, ToolSource,
};
pub use logger::{ExecutorLogger, LogLevel, TracingLogger};
