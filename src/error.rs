//! Error taxonomy for the voice session orchestrator.
//!
//! Only failures that terminate a connect attempt or a supervisor turn are
//! surfaced as values. Control-channel send failures and malformed inbound
//! frames are logged and swallowed at the point they occur, since both are
//! expected during transient connection states.

/// Fatal errors surfaced to the orchestrator's caller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The local audio source could not be opened (device missing or access
    /// denied). Fatal to the connect attempt, never retried internally.
    #[error("audio source unavailable: {0}")]
    MediaAcquisition(String),

    /// The credential exchange or connection negotiation with the remote
    /// service failed. Fatal to the connect attempt, with full teardown.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The external reasoning call failed. The affected turn is dropped; the
    /// session stays connected.
    #[error("supervisor call failed: {0}")]
    Supervisor(String),
}
