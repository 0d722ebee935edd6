//! User-facing delivery handlers

/// Processes the payload of one delivery.
///
/// Handlers run on the blocking thread pool, one call per delivery. Returning
/// an error (or panicking) marks the delivery as failed: it is reported and,
/// when acknowledgments are explicit, left unacknowledged.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload
    fn handle(&self, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        self(payload)
    }
}
