use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HamcError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    /// A single field was rejected before any intent was built.
    #[error("invalid value for {resource}.{param}: {message}")]
    #[diagnostic(help("fix the field and apply again; nothing was submitted"))]
    InvalidParameter {
        resource: String,
        param: String,
        message: String,
    },

    /// The configuration could not be generated from the current values.
    #[error("cannot generate configuration for {resource}: parameter '{param}' {message}")]
    Configuration {
        resource: String,
        param: String,
        message: String,
    },

    #[error("{intent} failed on {host}: {output}")]
    Command {
        intent: String,
        host: String,
        output: String,
    },

    #[error("unknown resource '{name}'")]
    UnknownResource { name: String },

    #[error("unknown host '{name}'")]
    UnknownHost { name: String },

    #[error("invalid score '{value}'")]
    #[diagnostic(help("use an integer, INFINITY, -INFINITY, ALWAYS or NEVER"))]
    InvalidScore { value: String },

    #[error("cannot read live state from {host}: {message}")]
    StateSource { host: String, message: String },

    #[error("cannot render output: {message}")]
    Output { message: String },

    #[error("worker failed: {message}")]
    Worker { message: String },
}
