use thiserror::Error;

/// A convenience `Result` alias using [`ConclaveError`].
pub type ConclaveResult<T> = Result<T, ConclaveError>;

/// Top-level error type for the Conclave coordination core.
///
/// Validation and invariant errors are always surfaced to the caller. Liveness
/// failures and attempt exhaustion are not errors at all: they show up as
/// queue states (`QUEUED` again, or `DEAD`).
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// Bad input, or an actor/phase/action combination that is not allowed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A payload carried a key reserved for transport state.
    #[error("Payload key '{0}' is reserved for queue state")]
    ReservedPayloadKey(String),

    /// A state change outside the allowed-transition table.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the record was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// A record, session or motion that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The concurrency guard could not admit a call before its deadline.
    #[error("Timed out after {waited_ms}ms waiting for a resource slot (tenant '{tenant}')")]
    ResourceTimeout {
        /// Tenant the call was made for.
        tenant: String,
        /// How long the caller was blocked.
        waited_ms: u64,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A failure reported by an external collaborator (notifier, archive, runtime).
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// An error from the backing SQLite store.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Stable snake_case tag for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ConclaveError::Validation(_) => "validation",
            ConclaveError::ReservedPayloadKey(_) => "reserved_key",
            ConclaveError::InvalidTransition { .. } => "invalid_transition",
            ConclaveError::NotFound(_) => "not_found",
            ConclaveError::ResourceTimeout { .. } => "resource_timeout",
            ConclaveError::Config(_) => "config",
            ConclaveError::Collaborator(_) => "collaborator",
            ConclaveError::Storage(_) => "storage",
            ConclaveError::Json(_) => "json",
            ConclaveError::Io(_) => "io",
        }
    }

    /// Render the error the way an agent-facing loop receives it: a tagged,
    /// human-readable line it can react to as structured output.
    pub fn to_agent_message(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }

    /// True for errors caused by the caller's input rather than the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConclaveError::Validation(_)
                | ConclaveError::ReservedPayloadKey(_)
                | ConclaveError::InvalidTransition { .. }
                | ConclaveError::NotFound(_)
        )
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ConclaveError::Validation(msg.into())
    }
}
