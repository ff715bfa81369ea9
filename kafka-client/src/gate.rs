use tokio_util::sync::CancellationToken;

/// One-shot latch: starts closed, opens once, stays open. Opening an open gate is a no-op,
/// so any number of tasks may race to open it.
#[derive(Clone, Default)]
pub struct ReadinessGate {
    token: CancellationToken,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.token.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the gate is open.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
