//! # opta_runner
//!
//! External command execution for opta.
//!
//! Every binary the engine talks to (terraform, helm, cloud CLIs)
//! is invoked through the [`CommandRunner`] trait so the orchestration code
//! can be exercised against [`MockRunner`] in tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use opta_runner::{CliRunner, CliRunnerOptions, CommandRunner, CommandSpec, RunConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = CliRunner::new(CliRunnerOptions::default());
//!     let spec = CommandSpec::new("terraform").arg("version");
//!     let result = runner.run(&spec, &RunConfig::default()).await?;
//!     println!("{}", result.stdout);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod mock;
pub mod runner;

pub use cli::{CliRunner, CliRunnerOptions, LogHandler, LogLine, LogStream};
pub use config::{CommandSpec, RunConfig};
pub use error::{RunnerError, RunnerResult};
pub use mock::{CapturedCall, MockResponse, MockRunner};
pub use runner::{CommandRunner, ExecutionResult};
