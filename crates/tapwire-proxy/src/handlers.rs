use tapwire_http::{HttpMessage, HttpResponseHead, HttpVersion};

use crate::dispatch::{HandlerContext, HandlerError, HttpMessageHandler};

/// Answers CONNECT requests with `200 Connection established` when no
/// earlier handler set a response, so tunnels proceed without an
/// upstream sender being involved.
#[derive(Debug, Default)]
pub struct ConnectEstablishedHandler;

impl HttpMessageHandler for ConnectEstablishedHandler {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        message: &mut HttpMessage,
    ) -> Result<(), HandlerError> {
        if ctx.is_from_client() && message.request.is_connect() && message.response.is_none() {
            message.set_response(HttpResponseHead::new(
                HttpVersion::Http11,
                200,
                "Connection established",
            ));
        }
        Ok(())
    }
}

/// Closes connections whose requests are addressed to the proxy itself,
/// breaking forwarding loops before any other handler acts on them.
#[derive(Debug, Default)]
pub struct CloseOnRecursiveRequestHandler;

impl HttpMessageHandler for CloseOnRecursiveRequestHandler {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        _message: &mut HttpMessage,
    ) -> Result<(), HandlerError> {
        if ctx.is_from_client() && ctx.is_recursive() {
            ctx.set_close();
        }
        Ok(())
    }
}
