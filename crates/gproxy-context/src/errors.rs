use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    /// Another owner already holds the context for this session (spec.md
    /// §4.2 L0); the caller must not steal it.
    #[error("ingress context is held by another owner")]
    ContextBusy,
    #[error("account has no spare ingress-context capacity")]
    QueueFull,
    /// Surfaces C1's own acquire failure (dial error, queue full, unknown
    /// account) unchanged — C2 never wraps it in a second taxonomy.
    #[error(transparent)]
    Pool(#[from] gproxy_pool::PoolError),
}
