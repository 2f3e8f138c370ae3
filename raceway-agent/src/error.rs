/// Errors surfaced by the agent's fallible operations.
///
/// Most of the agent is deliberately infallible from the host's point of
/// view: tracker calls outside a bound context are silent no-ops, invalid
/// inbound headers are ignored, and collector failures are logged and
/// dropped. The variants here cover the few operations that genuinely
/// cannot proceed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Propagation headers were requested while no context is bound to the
    /// current execution unit. There is nothing to propagate.
    #[error("no context is bound to the current execution unit")]
    PropagationOutsideContext,

    /// A scoped lock was requested while no context is bound. The lock
    /// events would have no causal anchor, so the lock is not taken.
    #[error("scoped lock tracking requires a bound context")]
    ContextRequired,

    /// The lock could not be acquired (a previous holder panicked).
    #[error("lock `{lock_id}` cannot be acquired")]
    LockUnavailable { lock_id: String },

    /// The configured collector endpoint is not a valid `http`/`https` URL.
    #[error("`{endpoint}` is not a valid collector endpoint")]
    InvalidEndpoint { endpoint: String },

    /// An outbound HTTP call failed in transport.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}
