pub mod algebra;
pub mod ast;
pub mod compiler;
pub mod config;
pub mod delta;
pub mod document;
pub mod engine;
pub mod error;
pub mod parser;
pub mod provenance;
pub mod sql;

pub use compiler::{Iteration, SqlContext};
pub use config::{EngineConfig, ProvenanceMode};
pub use document::Document;
pub use engine::{CycleStats, Engine, Session, SqliteSession};
pub use error::{CompileError, ExecError};
pub use parser::{parse_catalog, parse_command, Command, Program};
