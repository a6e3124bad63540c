// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Body-ownership delegation for everything that is not an RPC tunnel.
//!
//! After headers are parsed, the handlers are consulted in registration
//! order; the first to claim the request owns both the body read and the
//! reply. The core only shuttles bytes and enforces timeouts.

use std::any::Any;

use crate::error::HttpStatus;
use crate::request::HttpRequest;
use crate::stream::ByteStream;

/// A handler's answer to "is this request yours".
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// Not mine, ask the next handler.
    Decline,
    /// Mine; body and reply belong to me now.
    Accept,
    /// Mine, and it is already dead.
    Error(HttpStatus),
}

/// Streaming-response states, for handlers that produce asynchronously.
#[derive(Debug, PartialEq, Eq)]
pub enum Retrieve {
    /// Reply generation failed.
    Error,
    /// The handler's upstream missed its deadline (the FastCGI case).
    Timeout,
    /// Bytes were placed in the out stream; write them.
    Write,
    /// Nothing right now; come back immediately.
    None,
    /// Producer suspended; park the context.
    Wait,
    /// Response complete.
    Done,
}

/// Per-context scratch a handler may hang its state off.
#[derive(Default)]
pub struct HandlerSession {
    pub state: Option<Box<dyn Any + Send>>,
}

/// A content module: plugin, FastCGI bridge, static cache. External to the
/// core.
pub trait ContentHandler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn take_request(&self, req: &HttpRequest) -> Claim;

    /// Feeds a slice of request body. False fails the request with 400.
    fn write_request(&self, session: &mut HandlerSession, data: &[u8]) -> bool;

    /// Whether the handler has seen the whole request.
    fn end_of_request(&self, session: &mut HandlerSession) -> bool;

    /// Produces the response (or its head) into `out` once the body is
    /// complete.
    fn execute(
        &self,
        session: &mut HandlerSession,
        req: &HttpRequest,
        out: &mut ByteStream,
    ) -> Result<(), HttpStatus>;

    /// Pulls further response bytes for streaming producers.
    fn retrieve_response(&self, session: &mut HandlerSession, out: &mut ByteStream) -> Retrieve {
        let _ = (session, out);
        Retrieve::Done
    }

    /// Gives back any per-context state.
    fn release(&self, session: &mut HandlerSession) {
        session.state = None;
    }
}

/// Ordered registry of content handlers.
#[derive(Default)]
pub struct DelegationDispatcher {
    handlers: Vec<std::sync::Arc<dyn ContentHandler>>,
}

impl DelegationDispatcher {
    pub fn new() -> DelegationDispatcher {
        DelegationDispatcher::default()
    }

    pub fn add(mut self, handler: std::sync::Arc<dyn ContentHandler>) -> DelegationDispatcher {
        self.handlers.push(handler);
        self
    }

    /// First handler that claims `req`, or the error it raised.
    pub fn select(
        &self,
        req: &HttpRequest,
    ) -> Result<Option<std::sync::Arc<dyn ContentHandler>>, HttpStatus> {
        for handler in &self.handlers {
            tracing::trace!(handler = handler.name(), "try handler");
            match handler.take_request(req) {
                Claim::Decline => continue,
                Claim::Accept => {
                    tracing::trace!(handler = handler.name(), "claimed");
                    return Ok(Some(handler.clone()));
                }
                Claim::Error(status) => return Err(status),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug)]
    struct FixedHandler {
        name: &'static str,
        claim_prefix: &'static str,
    }

    impl ContentHandler for FixedHandler {
        fn name(&self) -> &str {
            self.name
        }
        fn take_request(&self, req: &HttpRequest) -> Claim {
            if req.uri.starts_with(self.claim_prefix) {
                Claim::Accept
            } else {
                Claim::Decline
            }
        }
        fn write_request(&self, _s: &mut HandlerSession, _d: &[u8]) -> bool {
            true
        }
        fn end_of_request(&self, _s: &mut HandlerSession) -> bool {
            true
        }
        fn execute(
            &self,
            _s: &mut HandlerSession,
            _req: &HttpRequest,
            _out: &mut ByteStream,
        ) -> Result<(), HttpStatus> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct AngryHandler;

    impl ContentHandler for AngryHandler {
        fn name(&self) -> &str {
            "angry"
        }
        fn take_request(&self, _req: &HttpRequest) -> Claim {
            Claim::Error(HttpStatus(403))
        }
        fn write_request(&self, _s: &mut HandlerSession, _d: &[u8]) -> bool {
            false
        }
        fn end_of_request(&self, _s: &mut HandlerSession) -> bool {
            true
        }
        fn execute(
            &self,
            _s: &mut HandlerSession,
            _req: &HttpRequest,
            _out: &mut ByteStream,
        ) -> Result<(), HttpStatus> {
            Err(HttpStatus(403))
        }
    }

    #[test]
    fn priority_order_wins() {
        let d = DelegationDispatcher::new()
            .add(Arc::new(FixedHandler {
                name: "first",
                claim_prefix: "/x",
            }))
            .add(Arc::new(FixedHandler {
                name: "second",
                claim_prefix: "/",
            }));
        let mut req = HttpRequest::default();
        req.uri = "/x/thing".into();
        let chosen = d.select(&req).unwrap().unwrap();
        assert_eq!(chosen.name(), "first");

        req.uri = "/y".into();
        let chosen = d.select(&req).unwrap().unwrap();
        assert_eq!(chosen.name(), "second");
    }

    #[test]
    fn nobody_claims_means_none() {
        let d = DelegationDispatcher::new().add(Arc::new(FixedHandler {
            name: "only",
            claim_prefix: "/never",
        }));
        let mut req = HttpRequest::default();
        req.uri = "/else".into();
        assert!(d.select(&req).unwrap().is_none());
    }

    #[test]
    fn handler_error_propagates() {
        let d = DelegationDispatcher::new().add(Arc::new(AngryHandler));
        let req = HttpRequest::default();
        assert_eq!(d.select(&req).unwrap_err(), HttpStatus(403));
    }
}
