/// Receives every complete inbound frame.
///
/// Called on the I/O thread that owns the connection, so implementations
/// must return quickly: a slow handler stalls every other socket on that loop.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn on_message(&self, payload: &[u8]) {
        self(payload)
    }
}
