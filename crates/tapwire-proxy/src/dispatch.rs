use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tapwire_http::{should_close_after, HttpMessage, HttpResponseHead, HttpVersion};
use thiserror::Error;

use crate::connection::ConnectionState;
use crate::recursive::is_recursive;

/// Error raised by a pluggable message handler. Isolated by the
/// dispatcher: it is logged and the remaining handlers still run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A pluggable message handler, invoked once per dispatch phase. Shared
/// across connections; implementations carry no per-connection state.
pub trait HttpMessageHandler: Send + Sync {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        message: &mut HttpMessage,
    ) -> Result<(), HandlerError>;
}

/// Per-message dispatch context. `overridden` and `close` are the only
/// signals a handler can use to change dispatcher control flow, and
/// both are monotonic.
#[derive(Debug)]
pub struct HandlerContext {
    recursive: bool,
    excluded: bool,
    from_client: bool,
    overridden: bool,
    close: bool,
}

impl HandlerContext {
    fn new() -> Self {
        Self {
            recursive: false,
            excluded: false,
            from_client: true,
            overridden: false,
            close: false,
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// True during the request phase, false during the response phase.
    pub fn is_from_client(&self) -> bool {
        self.from_client
    }

    /// Marks the message as handled; the remaining handlers of this
    /// phase and the other phase are skipped.
    pub fn set_overridden(&mut self) {
        self.overridden = true;
    }

    /// Requests that the connection be closed without writing a
    /// response.
    pub fn set_close(&mut self) {
        self.close = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Write the message's response (now guaranteed present), then keep
    /// or close the connection.
    Respond { close_after: bool },
    /// A handler requested close; nothing is written.
    CloseWithoutResponse,
}

/// Runs one decoded message through the ordered handler list, request
/// phase then response phase.
///
/// The recursive flag is recomputed from the current request before
/// every request-phase invocation (a handler rewriting the request
/// changes what later handlers observe) and latched once the response
/// phase begins. If no handler attached a response, a bare `HTTP/1.0 0`
/// response is synthesized rather than hanging the exchange.
pub fn dispatch_message(
    state: &ConnectionState,
    handlers: &[Arc<dyn HttpMessageHandler>],
    message: &mut HttpMessage,
) -> DispatchOutcome {
    state.set_processing(true);
    let mut ctx = HandlerContext::new();

    for handler in handlers {
        ctx.recursive = is_recursive(state, &message.request);
        ctx.excluded = state.server_config().is_excluded(&message.request);
        invoke_handler(handler.as_ref(), &mut ctx, message);
        if ctx.overridden || ctx.close {
            break;
        }
    }

    if ctx.close {
        state.set_processing(false);
        return DispatchOutcome::CloseWithoutResponse;
    }

    if !ctx.overridden {
        ctx.from_client = false;
        ctx.recursive = is_recursive(state, &message.request);
        ctx.excluded = state.server_config().is_excluded(&message.request);
        for handler in handlers {
            invoke_handler(handler.as_ref(), &mut ctx, message);
            if ctx.overridden || ctx.close {
                break;
            }
        }
        if ctx.close {
            state.set_processing(false);
            return DispatchOutcome::CloseWithoutResponse;
        }
    }

    if message.response.is_none() {
        message.set_response(HttpResponseHead::new(HttpVersion::Http10, 0, ""));
    }

    let close_after = should_close_after(message);
    state.set_processing(false);
    DispatchOutcome::Respond { close_after }
}

fn invoke_handler(
    handler: &dyn HttpMessageHandler,
    ctx: &mut HandlerContext,
    message: &mut HttpMessage,
) {
    match catch_unwind(AssertUnwindSafe(|| handler.handle_message(ctx, message))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(%error, "message handler failed");
        }
        Err(_) => {
            tracing::warn!("message handler panicked");
        }
    }
}
