//! Modify handler: attribute changes, membership edges, password updates

use super::{HandlerError, RequestContext, Responder};
use crate::auth;
use crate::dn::{dn_to_path, validate_dn};
use crate::error::OperationError;
use crate::ldap::{
    LdapResult, ModifyRequest, ModifyResponse, Operation, ProtocolOp, ResultCode,
};
use crate::store::{AttrChange, AttrValue, DirectoryEntry, EntryId};
use chrono::Utc;
use tracing::debug;

pub(super) async fn handle(
    ctx: &RequestContext,
    req: ModifyRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    super::require_user(ctx).await?;

    let dn = req.object.0.as_ref();
    if !validate_dn(dn) {
        return Err(OperationError::invalid_dn("invalid entry DN").into());
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

    let mut changes: Vec<AttrChange> = Vec::new();
    for change in &req.changes {
        translate_change(ctx, &entry, &base_dn, change, &mut changes).await?;
    }

    debug!(dn = %dn, changes = changes.len(), "modify entry");
    // the whole change list is applied in one transaction; any failure
    // rolls all of it back
    ctx.store
        .apply_changes(entry.id, changes)
        .await
        .map_err(OperationError::from)?;

    out.send(ProtocolOp::ModifyResponse(ModifyResponse {
        result: LdapResult::success(""),
    }))
    .await?;
    Ok(())
}

async fn translate_change(
    ctx: &RequestContext,
    entry: &DirectoryEntry,
    base_dn: &str,
    change: &crate::ldap::Change<'static>,
    changes: &mut Vec<AttrChange>,
) -> Result<(), HandlerError> {
    let name = change.modification.attr_type.0.to_string();
    let key = name.to_lowercase();
    let values: Vec<AttrValue> = change
        .modification
        .attr_vals
        .iter()
        .map(|v| AttrValue::from_bytes(&v.0))
        .collect();

    if key == "memberof" {
        let groups = resolve_groups(ctx, base_dn, &values).await?;
        match change.operation {
            Operation::Add => changes.push(AttrChange::AddGroups { groups }),
            Operation::Delete => {
                if values.is_empty() {
                    changes.push(AttrChange::RemoveGroups { groups: None });
                } else {
                    changes.push(AttrChange::RemoveGroups {
                        groups: Some(groups),
                    });
                }
            }
            Operation::Replace => {
                changes.push(AttrChange::RemoveGroups { groups: None });
                changes.push(AttrChange::AddGroups { groups });
            }
            other => {
                return Err(OperationError::protocol_error(format!(
                    "unknown modify operation {}",
                    other.0
                ))
                .into())
            }
        }
        return Ok(());
    }

    if key == "userpassword" || key == "unicodepwd" {
        let password = values
            .first()
            .and_then(|v| v.as_text())
            .ok_or_else(|| OperationError::unwilling("password must be a UTF-8 value"))?;
        changes.push(password_change(ctx, entry, password).await?);
        return Ok(());
    }

    match change.operation {
        Operation::Add => changes.push(AttrChange::AddValues { name, values }),
        Operation::Delete => {
            if values.is_empty() {
                changes.push(AttrChange::DeleteAttribute { name });
            } else {
                changes.push(AttrChange::DeleteValues { name, values });
            }
        }
        Operation::Replace => changes.push(AttrChange::Replace { name, values }),
        other => {
            return Err(OperationError::protocol_error(format!(
                "unknown modify operation {}",
                other.0
            ))
            .into())
        }
    }
    Ok(())
}

/// Run the password policy before accepting the new secret
async fn password_change(
    ctx: &RequestContext,
    entry: &DirectoryEntry,
    password: &str,
) -> Result<AttrChange, OperationError> {
    let user = ctx
        .store
        .user_by_directory(entry.id)
        .await?
        .ok_or_else(|| OperationError::unwilling("entry has no user account"))?;
    let policy = ctx.store.password_policy().await?;

    let attributes = ctx.store.entry_attributes(entry.id).await?;
    let pwd_last_set = attributes
        .iter()
        .find(|attr| attr.name.eq_ignore_ascii_case("pwdLastSet"))
        .and_then(|attr| attr.value.as_text())
        .map(str::to_string);

    let errors = crate::policy::validate_password(
        &policy,
        password,
        &user,
        pwd_last_set.as_deref(),
        Utc::now(),
    );
    if !errors.is_empty() {
        return Err(OperationError::new(
            ResultCode::ConstraintViolation,
            errors.join("; "),
        ));
    }

    let hash = auth::hash_password(password)
        .map_err(|e| OperationError::new(ResultCode::Other, e.to_string()))?;
    Ok(AttrChange::SetPassword { hash })
}

async fn resolve_groups(
    ctx: &RequestContext,
    base_dn: &str,
    values: &[AttrValue],
) -> Result<Vec<EntryId>, OperationError> {
    let mut groups = Vec::with_capacity(values.len());
    for value in values {
        let group_dn = value
            .as_text()
            .ok_or_else(|| OperationError::invalid_dn("memberOf value is not UTF-8"))?;
        let path = dn_to_path(group_dn, base_dn)
            .ok_or_else(|| OperationError::no_such_object("memberOf target is out of scope"))?;
        let entry = ctx
            .store
            .find_by_path(&path)
            .await?
            .ok_or_else(|| OperationError::no_such_object("memberOf target does not exist"))?;
        groups.push(entry.id);
    }
    Ok(groups)
}
