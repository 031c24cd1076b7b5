//! Add handler: entry creation with user/group side rows and memberOf edges

use super::{HandlerError, RequestContext, Responder};
use crate::auth;
use crate::dn::{base_dn_to_realm, dn_to_path, rdn_pair, validate_dn};
use crate::error::OperationError;
use crate::ldap::{AddRequest, LdapResult, ProtocolOp, ResultCode};
use crate::store::{AttrValue, EntryId, NewEntry, NewUser, StoredAttribute};
use tracing::debug;

/// Object classes that get a specialised side row
const PRIMARY_CLASSES: &[&str] = &["user", "group", "computer"];

pub(super) async fn handle(
    ctx: &RequestContext,
    req: AddRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    super::require_user(ctx).await?;

    let dn = req.entry.0.as_ref();
    if !validate_dn(dn) {
        return Err(OperationError::invalid_dn("invalid entry DN").into());
    }
    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;
    let path = dn_to_path(dn, &base_dn)
        .ok_or_else(|| OperationError::no_such_object("entry is out of this naming context"))?;
    if path.is_empty() {
        return Err(
            OperationError::new(ResultCode::EntryAlreadyExists, "naming context exists").into(),
        );
    }

    let Some((rdn, parent_path)) = path.split_last() else {
        return Err(OperationError::invalid_dn("invalid entry DN").into());
    };
    let (_, rdn_value) = rdn_pair(rdn).ok_or_else(|| OperationError::invalid_dn("invalid RDN"))?;
    let rdn_value = rdn_value.to_string();
    let parent = ctx
        .store
        .find_by_path(parent_path)
        .await
        .map_err(OperationError::from)?
        .ok_or_else(|| OperationError::no_such_object("parent does not exist"))?;

    let mut object_classes: Vec<String> = Vec::new();
    let mut member_of: Vec<EntryId> = Vec::new();
    let mut password: Option<String> = None;
    let mut attributes: Vec<StoredAttribute> = Vec::new();
    let mut plain: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for attr in &req.attributes {
        let key = attr.attr_type.0.to_lowercase();
        match key.as_str() {
            "objectclass" => {
                for value in &attr.attr_vals {
                    let class = String::from_utf8_lossy(&value.0).into_owned();
                    object_classes.push(class.clone());
                    attributes.push(StoredAttribute {
                        name: attr.attr_type.0.to_string(),
                        value: AttrValue::Text(class),
                    });
                }
            }
            "memberof" => {
                for value in &attr.attr_vals {
                    let group_dn = String::from_utf8_lossy(&value.0).into_owned();
                    member_of.push(resolve_group(ctx, &group_dn, &base_dn).await?);
                }
            }
            "userpassword" | "unicodepwd" => {
                password = attr
                    .attr_vals
                    .first()
                    .map(|v| String::from_utf8_lossy(&v.0).into_owned());
            }
            _ => {
                for value in &attr.attr_vals {
                    let value = AttrValue::from_bytes(&value.0);
                    if let AttrValue::Text(text) = &value {
                        plain.entry(key.clone()).or_insert_with(|| text.clone());
                    }
                    attributes.push(StoredAttribute {
                        name: attr.attr_type.0.to_string(),
                        value,
                    });
                }
            }
        }
    }

    if object_classes.is_empty() {
        return Err(OperationError::new(
            ResultCode::ObjectClassViolation,
            "objectClass is required",
        )
        .into());
    }
    let object_class = PRIMARY_CLASSES
        .iter()
        .find_map(|primary| {
            object_classes
                .iter()
                .find(|c| c.eq_ignore_ascii_case(primary))
        })
        .cloned()
        .unwrap_or_else(|| object_classes[0].clone());

    let user = if object_class.eq_ignore_ascii_case("user") {
        let realm = base_dn_to_realm(&base_dn);
        let password_hash = match password {
            Some(password) => auth::hash_password(&password)
                .map_err(|e| OperationError::new(ResultCode::Other, e.to_string()))?,
            None => String::new(),
        };
        Some(NewUser {
            sam_account_name: plain
                .get("samaccountname")
                .cloned()
                .unwrap_or_else(|| rdn_value.to_string()),
            user_principal_name: plain
                .get("userprincipalname")
                .cloned()
                .unwrap_or_else(|| format!("{rdn_value}@{realm}")),
            display_name: plain.get("displayname").cloned().unwrap_or_default(),
            mail: plain.get("mail").cloned().unwrap_or_default(),
            password_hash,
        })
    } else {
        None
    };

    debug!(dn = %dn, class = %object_class, "add entry");
    ctx.store
        .add_entry(NewEntry {
            parent: parent.id,
            name: rdn.clone(),
            object_class: object_class.to_lowercase(),
            attributes,
            member_of,
            user,
        })
        .await
        .map_err(OperationError::from)?;

    out.send(ProtocolOp::AddResponse(LdapResult::success("")))
        .await?;
    Ok(())
}

async fn resolve_group(
    ctx: &RequestContext,
    group_dn: &str,
    base_dn: &str,
) -> Result<EntryId, OperationError> {
    let path = dn_to_path(group_dn, base_dn)
        .ok_or_else(|| OperationError::no_such_object("memberOf target is out of scope"))?;
    let entry = ctx
        .store
        .find_by_path(&path)
        .await?
        .ok_or_else(|| OperationError::no_such_object("memberOf target does not exist"))?;
    Ok(entry.id)
}
