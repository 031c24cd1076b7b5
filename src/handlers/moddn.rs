//! ModifyDN handler: rename/move with atomic subtree path rewrite

use super::{HandlerError, RequestContext, Responder};
use crate::dn::{dn_to_path, rdn_pair, validate_dn};
use crate::error::OperationError;
use crate::ldap::{LdapResult, ModDnRequest, ProtocolOp};
use tracing::debug;

pub(super) async fn handle(
    ctx: &RequestContext,
    req: ModDnRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    super::require_user(ctx).await?;

    let dn = req.entry.0.as_ref();
    if !validate_dn(dn) {
        return Err(OperationError::invalid_dn("invalid entry DN").into());
    }
    if rdn_pair(&req.newrdn.0).is_none() {
        return Err(OperationError::invalid_dn("invalid new RDN").into());
    }

    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;
    let path = dn_to_path(dn, &base_dn)
        .ok_or_else(|| OperationError::no_such_object("entry is out of this naming context"))?;
    let entry = ctx
        .store
        .find_by_path(&path)
        .await
        .map_err(OperationError::from)?
        .ok_or_else(|| OperationError::no_such_object("no such object"))?;

    let new_parent = match &req.newsuperior {
        Some(superior) => {
            let superior_path = dn_to_path(&superior.0, &base_dn).ok_or_else(|| {
                OperationError::no_such_object("new superior is out of this naming context")
            })?;
            let parent = ctx
                .store
                .find_by_path(&superior_path)
                .await
                .map_err(OperationError::from)?
                .ok_or_else(|| OperationError::no_such_object("new superior does not exist"))?;
            Some(parent.id)
        }
        None => None,
    };

    debug!(dn = %dn, newrdn = %req.newrdn.0, "modify dn");
    ctx.store
        .rename_entry(
            entry.id,
            &req.newrdn.0,
            req.deleteoldrdn,
            new_parent,
        )
        .await
        .map_err(OperationError::from)?;

    out.send(ProtocolOp::ModDnResponse(LdapResult::success("")))
        .await?;
    Ok(())
}
