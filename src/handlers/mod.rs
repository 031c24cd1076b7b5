//! LDAP operation handlers
//!
//! One handler per protocol op. Handlers emit response records through a
//! [`Responder`]; the dispatcher pairs every handler failure with the
//! response type the request expects and keeps the connection alive for
//! expected business failures.

mod add;
mod bind;
mod delete;
mod extended;
mod moddn;
mod modify;
mod search;

use crate::config::ServerConfig;
use crate::error::OperationError;
use crate::ldap::{
    BindResponse, ExtendedResponse, LdapMessage, LdapResult, MessageID, ModifyResponse,
    ProtocolOp, ProtocolOpTag, ResultCode,
};
use crate::mfa::{MfaExchange, MultifactorApi};
use crate::session::Session;
use crate::store::DirectoryStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Everything a handler invocation needs
#[derive(Clone)]
pub struct RequestContext {
    pub store: Arc<dyn DirectoryStore>,
    pub session: Arc<Session>,
    pub config: Arc<ServerConfig>,
    pub mfa_exchange: Arc<MfaExchange>,
    pub mfa_api: Option<Arc<MultifactorApi>>,
    /// Cancelled by Abandon or connection teardown; checked between
    /// response emissions
    pub cancel: CancellationToken,
}

/// The write side of the connection went away
#[derive(Debug)]
pub struct ConnectionClosed;

#[derive(Debug)]
pub enum HandlerError {
    Op(OperationError),
    Closed,
}

impl From<OperationError> for HandlerError {
    fn from(e: OperationError) -> Self {
        HandlerError::Op(e)
    }
}

impl From<crate::store::StoreError> for HandlerError {
    fn from(e: crate::store::StoreError) -> Self {
        HandlerError::Op(e.into())
    }
}

impl From<ConnectionClosed> for HandlerError {
    fn from(_: ConnectionClosed) -> Self {
        HandlerError::Closed
    }
}

/// Sends response records for one request through the connection writer
#[derive(Clone)]
pub struct Responder {
    message_id: MessageID,
    tx: mpsc::Sender<LdapMessage<'static>>,
}

impl Responder {
    pub fn new(message_id: MessageID, tx: mpsc::Sender<LdapMessage<'static>>) -> Self {
        Responder { message_id, tx }
    }

    pub async fn send(&self, op: ProtocolOp<'static>) -> Result<(), ConnectionClosed> {
        self.tx
            .send(LdapMessage::response(self.message_id, op))
            .await
            .map_err(|_| ConnectionClosed)
    }
}

/// Route one request to its handler and report failures as responses
pub async fn dispatch(ctx: &RequestContext, op: ProtocolOp<'static>, out: &Responder) {
    let tag = op.tag();
    let outcome = match op {
        ProtocolOp::BindRequest(req) => bind::handle(ctx, req, out).await,
        ProtocolOp::SearchRequest(req) => search::handle(ctx, req, out).await,
        ProtocolOp::AddRequest(req) => add::handle(ctx, req, out).await,
        ProtocolOp::ModifyRequest(req) => modify::handle(ctx, req, out).await,
        ProtocolOp::ModDnRequest(req) => moddn::handle(ctx, req, out).await,
        ProtocolOp::DelRequest(dn) => delete::handle(ctx, dn, out).await,
        ProtocolOp::ExtendedRequest(req) => extended::handle(ctx, req, out).await,
        ProtocolOp::CompareRequest(_) => Err(HandlerError::Op(OperationError::unwilling(
            "compare is not supported",
        ))),
        // Unbind, Abandon and StartTLS are intercepted by the session loop
        ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_) => Ok(()),
        other => {
            warn!(tag = %other.tag(), "client sent a non-request protocol op");
            Err(HandlerError::Op(OperationError::protocol_error(
                "not a request",
            )))
        }
    };

    match outcome {
        Ok(()) => {}
        Err(HandlerError::Closed) => {}
        Err(HandlerError::Op(err)) => {
            if err.code == ResultCode::OperationsError || err.code == ResultCode::Other {
                error!(code = ?err.code, message = %err.message, "operation failed unexpectedly");
            }
            if let Some(response) = error_response(tag, &err) {
                let _ = out.send(response).await;
            }
        }
    }
}

/// The response op matching a request tag, carrying the failure
fn error_response(tag: ProtocolOpTag, err: &OperationError) -> Option<ProtocolOp<'static>> {
    let result = LdapResult::new(err.code, err.matched_dn.clone(), err.message.clone());
    let op = match tag {
        ProtocolOpTag::BindRequest => ProtocolOp::BindResponse(BindResponse {
            result,
            server_sasl_creds: None,
        }),
        ProtocolOpTag::SearchRequest => ProtocolOp::SearchResultDone(result),
        ProtocolOpTag::ModifyRequest => ProtocolOp::ModifyResponse(ModifyResponse { result }),
        ProtocolOpTag::AddRequest => ProtocolOp::AddResponse(result),
        ProtocolOpTag::DelRequest => ProtocolOp::DelResponse(result),
        ProtocolOpTag::ModDnRequest => ProtocolOp::ModDnResponse(result),
        ProtocolOpTag::CompareRequest => ProtocolOp::CompareResponse(result),
        ProtocolOpTag::ExtendedRequest => ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            response_name: None,
            response_value: None,
        }),
        _ => return None,
    };
    Some(op)
}

/// Mutating operations require an authenticated session
async fn require_user(ctx: &RequestContext) -> Result<crate::store::UserRecord, OperationError> {
    ctx.session.user().await.ok_or_else(|| {
        OperationError::new(ResultCode::InsufficientAccessRights, "authentication required")
    })
}
