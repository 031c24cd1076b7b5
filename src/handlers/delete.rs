//! Delete handler: leaf-only removal with cascade of side rows

use super::{HandlerError, RequestContext, Responder};
use crate::dn::{dn_to_path, validate_dn};
use crate::error::OperationError;
use crate::ldap::{LdapDN, LdapResult, ProtocolOp};
use tracing::debug;

pub(super) async fn handle(
    ctx: &RequestContext,
    dn: LdapDN<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    super::require_user(ctx).await?;

    if !validate_dn(&dn.0) {
        return Err(OperationError::invalid_dn("invalid entry DN").into());
    }
    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;
    let path = dn_to_path(&dn.0, &base_dn)
        .ok_or_else(|| OperationError::no_such_object("entry is out of this naming context"))?;
    let entry = ctx
        .store
        .find_by_path(&path)
        .await
        .map_err(OperationError::from)?
        .ok_or_else(|| OperationError::no_such_object("no such object"))?;

    debug!(dn = %dn.0, "delete entry");
    ctx.store
        .delete_entry(entry.id)
        .await
        .map_err(OperationError::from)?;

    out.send(ProtocolOp::DelResponse(LdapResult::success("")))
        .await?;
    Ok(())
}
