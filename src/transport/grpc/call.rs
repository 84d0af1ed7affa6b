use tracing::debug;

use crate::error::RpcError;

/// Lifecycle of one client-side streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Listening for data, error and end.
    Active,
    /// The caller stopped listening and the call was cancelled.
    ClientCancelled,
    /// The server failed the call.
    ServerError,
    /// The server completed the call.
    Ended,
}

/// Decides which events of a streaming call reach the caller.
///
/// Once a call reaches a terminal state nothing more is reported. A cancellation error
/// that follows a client-initiated cancel is swallowed.
#[derive(Debug)]
pub struct StreamingCall {
    state: CallState,
}

impl Default for StreamingCall {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingCall {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn start(&mut self) {
        if self.state == CallState::Idle {
            self.state = CallState::Active;
        }
    }

    /// Record a client cancel. Returns `true` if the underlying call must be cancelled,
    /// which happens at most once and never after the call finished.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            CallState::Idle | CallState::Active => {
                self.state = CallState::ClientCancelled;
                true
            }
            _ => false,
        }
    }

    /// Whether a data reply should be delivered.
    pub fn on_data(&self) -> bool {
        self.state == CallState::Active
    }

    /// Returns the error to report, if any.
    pub fn on_error(&mut self, err: RpcError) -> Option<RpcError> {
        match self.state {
            CallState::Idle | CallState::Active => {
                self.state = CallState::ServerError;
                Some(err)
            }
            CallState::ClientCancelled if !err.is_cancellation() => {
                // Not caused by our cancel; the caller is gone, so only note it.
                debug!(error = %err, "Error after client cancel");
                None
            }
            _ => None,
        }
    }

    /// Whether completion should be reported.
    pub fn on_end(&mut self) -> bool {
        if self.state == CallState::Active {
            self.state = CallState::Ended;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> StreamingCall {
        let mut call = StreamingCall::new();
        call.start();
        call
    }

    #[test]
    fn test_cancel_is_issued_once() {
        let mut call = active();
        assert!(call.cancel());
        assert!(!call.cancel());
        assert_eq!(call.state(), CallState::ClientCancelled);
    }

    #[test]
    fn test_cancellation_after_client_cancel_is_suppressed() {
        let mut call = active();
        assert!(call.on_data());
        call.cancel();

        assert!(call.on_error(RpcError::Cancelled).is_none());
        assert!(!call.on_data());
        assert!(!call.on_end());
    }

    #[test]
    fn test_server_cancellation_is_propagated() {
        let mut call = active();
        let err = call.on_error(RpcError::Cancelled);
        assert!(matches!(err, Some(RpcError::Cancelled)));
        assert_eq!(call.state(), CallState::ServerError);
    }

    #[test]
    fn test_server_error_is_reported_once_and_blocks_cancel() {
        let mut call = active();
        assert!(call.on_error(RpcError::handler("boom")).is_some());
        assert!(call.on_error(RpcError::handler("again")).is_none());
        assert!(!call.cancel());
    }

    #[test]
    fn test_end_detaches() {
        let mut call = active();
        assert!(call.on_end());
        assert!(!call.on_data());
        assert!(!call.on_end());
        assert!(call.on_error(RpcError::Cancelled).is_none());
        assert!(!call.cancel());
    }
}
