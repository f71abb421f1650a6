//! User-facing error channel shared by the endpoint workers.

use std::sync::{Arc, Mutex as StdMutex};

use tokio_util::sync::CancellationToken;

/// First error wins: it is stashed for the command's exit path and the root
/// context is cancelled so every worker unwinds.
#[derive(Clone)]
pub struct ErrorSink {
    slot: Arc<StdMutex<Option<anyhow::Error>>>,
    root: CancellationToken,
}

impl ErrorSink {
    pub fn new(root: CancellationToken) -> ErrorSink {
        ErrorSink {
            slot: Arc::new(StdMutex::new(None)),
            root,
        }
    }

    pub fn fire(&self, err: anyhow::Error) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.root.cancel();
    }

    /// Take the stored error, if any. Called once after the root context is
    /// done.
    pub fn take(&self) -> Option<anyhow::Error> {
        self.slot.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_and_cancels_root() {
        let root = CancellationToken::new();
        let sink = ErrorSink::new(root.clone());
        sink.fire(anyhow::anyhow!("first"));
        sink.fire(anyhow::anyhow!("second"));
        assert!(root.is_cancelled());
        assert_eq!(sink.take().unwrap().to_string(), "first");
        assert!(sink.take().is_none());
    }
}
