//! circus core - the process primitive
//!
//! This crate provides [`Process`], a single supervised OS child:
//! templated command line, configured environment, resource limits and
//! captured or discarded output streams, with pid-based ordering.
//!
//! It has no dependency on the daemon or the wire protocol.
//!
//! Production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()` or direct indexing.

pub mod error;
pub mod process;
pub mod rlimit;
pub mod template;

pub use error::{ProcessError, ProcessResult};
pub use process::{Args, Process, ProcessConfig, ProcessInfo, ProcessStatus};
pub use rlimit::{Rlimit, RlimitError, RlimitSet};
pub use template::{TemplateContext, TemplateError};
