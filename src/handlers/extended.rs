//! Extended operation handler
//!
//! StartTLS never reaches this point: the session loop intercepts it so the
//! framing layer can run the handshake before the next read. Everything else
//! is rejected.

use super::{HandlerError, RequestContext, Responder};
use crate::error::OperationError;
use crate::ldap::{ExtendedRequest, STARTTLS_OID};
use tracing::warn;

pub(super) async fn handle(
    _ctx: &RequestContext,
    req: ExtendedRequest<'static>,
    _out: &Responder,
) -> Result<(), HandlerError> {
    if req.request_name.0 == STARTTLS_OID {
        // reachable only when TLS is not configured or already established
        return Err(OperationError::protocol_error("cannot start TLS").into());
    }
    warn!(oid = %req.request_name.0, "unsupported extended operation");
    Err(OperationError::protocol_error("unsupported extended operation").into())
}
