//! Observable list of calls awaiting their acknowledgment.

use std::sync::Arc;

use tokio::sync::watch;

/// Signatures (`event(args)`) of calls currently in flight, in start order.
///
/// Duplicates are kept: two identical calls in flight appear twice, and
/// completing one removes exactly one occurrence.
#[derive(Debug, Clone)]
pub struct OngoingCalls {
    calls: Arc<watch::Sender<Vec<String>>>,
}

impl Default for OngoingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl OngoingCalls {
    /// Empty list.
    pub fn new() -> Self {
        let (calls, _) = watch::channel(Vec::new());
        Self {
            calls: Arc::new(calls),
        }
    }

    /// Current list.
    pub fn snapshot(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Number of calls in flight.
    pub fn len(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.calls.borrow().is_empty()
    }

    /// Watch the list change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.calls.subscribe()
    }

    /// Record a call start. The call is removed when the guard drops.
    pub(crate) fn begin(&self, signature: &str) -> OngoingCallGuard {
        self.calls.send_modify(|calls| calls.push(signature.to_string()));
        OngoingCallGuard {
            calls: self.clone(),
            signature: signature.to_string(),
        }
    }

    fn finish(&self, signature: &str) {
        self.calls.send_if_modified(|calls| {
            match calls.iter().position(|s| s == signature) {
                Some(idx) => {
                    calls.remove(idx);
                    true
                }
                None => false,
            }
        });
    }
}

/// Removes its call from the list on drop, whether the call succeeded,
/// failed, or was cancelled.
#[derive(Debug)]
pub(crate) struct OngoingCallGuard {
    calls: OngoingCalls,
    signature: String,
}

impl Drop for OngoingCallGuard {
    fn drop(&mut self) {
        self.calls.finish(&self.signature);
    }
}
