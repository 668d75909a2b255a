//! Error types for mapping compilation and program execution.

use thiserror::Error;

/// Deterministic failures while compiling mappings into maintenance rules
/// or rules into SQL.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A head variable is neither bound by the body nor Skolem-defined.
    #[error("unsafe rule {rule}: variable {variable} is not bound by any positive body atom")]
    UnsafeRule { rule: String, variable: String },

    #[error("incompatible types in {mapping}: {detail}")]
    IncompatibleTypes { mapping: String, detail: String },

    #[error("incompatible keys in {mapping}: {detail}")]
    IncompatibleKeys { mapping: String, detail: String },

    #[error("incompatible schema: {0}")]
    IncompatibleSchema(String),

    /// Rejected before any rule is processed.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("malformed type descriptor {0:?}")]
    MalformedType(String),

    #[error("integer {0} does not fit in 64 bits")]
    IntegerOutOfRange(String),

    #[error("relation {0} has no primary key")]
    MissingKey(String),

    #[error("unknown relation {0}")]
    UnknownRelation(String),

    #[error("{relation} expects {expected} arguments, found {found}")]
    Arity {
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("unsupported mapping {mapping}: {detail}")]
    Unsupported { mapping: String, detail: String },

    /// Non-materialized relations that (transitively) define themselves.
    #[error("cannot compose away recursive virtual relations: {0}")]
    RecursiveComposition(String),

    /// A failure attributed to the rule it happened in.
    #[error("rule {rule} ({text}): {source}")]
    InRule {
        rule: String,
        text: String,
        #[source]
        source: Box<CompileError>,
    },

    #[error("{} rules failed to compile; first: {}", .0.len(), .0[0])]
    Rules(Vec<CompileError>),
}

impl CompileError {
    pub fn in_rule(self, rule: &crate::ast::Rule) -> Self {
        match self {
            err @ CompileError::InRule { .. } => err,
            err => CompileError::InRule {
                rule: rule.id.clone(),
                text: rule.to_string(),
                source: Box::new(err),
            },
        }
    }
}

/// Failures while running compiled statements against a session.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The database could not be reached or opened.
    #[error("connection failed: {0}")]
    Connectivity(String),

    /// A table or relation the program refers to does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Io(#[source] rusqlite::Error),

    /// A semi-naive loop did not reach a fixpoint.
    #[error("stratum {stratum} did not converge after {iterations} iterations")]
    Diverged { stratum: usize, iterations: usize },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl From<rusqlite::Error> for ExecError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let classified = match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let text = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.code {
                    ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied => {
                        Some(ExecError::Connectivity(text))
                    }
                    _ if text.starts_with("no such table") || text.starts_with("no such column") => {
                        Some(ExecError::NotFound(text))
                    }
                    _ => None,
                }
            }
            rusqlite::Error::QueryReturnedNoRows => Some(ExecError::NotFound(err.to_string())),
            _ => None,
        };
        classified.unwrap_or(ExecError::Io(err))
    }
}
