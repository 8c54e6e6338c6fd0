use async_trait::async_trait;

/// Yes/no answers for destructive or overwriting operations.
///
/// A `false` answer is a clean cancellation, never an error.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Answers every prompt with the same value (`--yes`, tests).
#[derive(Debug, Clone, Copy)]
pub struct Always(pub bool);

#[async_trait]
impl Confirm for Always {
    async fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!(prompt, answer = self.0, "auto-answered confirmation");
        self.0
    }
}
