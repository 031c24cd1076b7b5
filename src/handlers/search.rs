//! Search handler: RootDSE, scoped tree queries, streamed entries

use super::{HandlerError, RequestContext, Responder};
use crate::dn::dn_to_path;
use crate::error::OperationError;
use crate::filter::PartialAttribute;
use crate::ldap::{
    LdapResult, ProtocolOp, ResultCode, SearchRequest, SearchResultEntry, SearchScope,
    STARTTLS_OID,
};
use crate::query::FilterCompiler;
use crate::store::{Scope, SearchHit, SearchQuery, StoredAttribute};
use futures::StreamExt;
use std::borrow::Cow;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

pub(super) async fn handle(
    ctx: &RequestContext,
    req: SearchRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    debug!(base = %req.base_object.0, scope = ?req.scope, filter = %req.filter, "search");

    if req.base_object.0.is_empty()
        && req.scope == SearchScope::BaseObject
        && req.filter.is_object_class_presence()
    {
        return root_dse(ctx, &req, out).await;
    }

    // anonymous peers see only the RootDSE
    if ctx.session.user().await.is_none() {
        return Err(OperationError::new(
            ResultCode::InsufficientAccessRights,
            "authentication required",
        )
        .into());
    }

    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;
    let base_path = dn_to_path(&req.base_object.0, &base_dn)
        .ok_or_else(|| OperationError::no_such_object("base object is out of scope"))?;
    let base = ctx
        .store
        .find_by_path(&base_path)
        .await
        .map_err(OperationError::from)?
        .ok_or_else(|| OperationError::no_such_object("no such base object"))?;

    let scope = match req.scope {
        SearchScope::BaseObject => Scope::Base,
        SearchScope::SingleLevel => Scope::OneLevel,
        SearchScope::WholeSubtree => Scope::Subtree,
        SearchScope::SubordinateSubtree => Scope::SubordinateSubtree,
        other => {
            return Err(
                OperationError::protocol_error(format!("unknown scope {}", other.0)).into(),
            )
        }
    };

    let compiler = FilterCompiler::new(
        ctx.store.as_ref(),
        &base_dn,
        ctx.config.approx_as_inequality,
    );
    let predicate = compiler.compile(&req.filter).await?;

    let mut stream = ctx
        .store
        .search(SearchQuery {
            base: base.id,
            scope,
            predicate,
        })
        .await
        .map_err(OperationError::from)?;

    let deadline = (req.time_limit > 0)
        .then(|| Instant::now() + std::time::Duration::from_secs(u64::from(req.time_limit)));
    let mut sent: u32 = 0;

    while let Some(hit) = stream.next().await {
        // cooperative cancel between emissions (Abandon, connection close)
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                out.send(ProtocolOp::SearchResultDone(LdapResult::new(
                    ResultCode::TimeLimitExceeded,
                    "",
                    "time limit exceeded",
                )))
                .await?;
                return Ok(());
            }
        }
        let hit = hit.map_err(OperationError::from)?;
        if req.size_limit > 0 && sent >= req.size_limit {
            out.send(ProtocolOp::SearchResultDone(LdapResult::new(
                ResultCode::SizeLimitExceeded,
                "",
                "size limit exceeded",
            )))
            .await?;
            return Ok(());
        }
        let entry = render_entry(&hit, &base_dn, &req);
        out.send(ProtocolOp::SearchResultEntry(entry)).await?;
        sent += 1;
    }

    out.send(ProtocolOp::SearchResultDone(LdapResult::success("")))
        .await?;
    Ok(())
}

/// Project one search hit through the request's attribute selection
fn render_entry(
    hit: &SearchHit,
    base_dn: &str,
    req: &SearchRequest<'static>,
) -> SearchResultEntry<'static> {
    let selection: Vec<String> = req
        .attributes
        .iter()
        .map(|attr| attr.0.to_lowercase())
        .collect();
    let no_attrs = selection.iter().any(|s| s == "1.1");
    let all_attrs = selection.is_empty() || selection.iter().any(|s| s == "*" || s == "+");

    let mut grouped: Vec<(String, Vec<Vec<u8>>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    if !no_attrs {
        for StoredAttribute { name, value } in &hit.attributes {
            let key = name.to_lowercase();
            if !all_attrs && !selection.contains(&key) {
                continue;
            }
            let slot = *index.entry(key).or_insert_with(|| {
                grouped.push((name.clone(), Vec::new()));
                grouped.len() - 1
            });
            grouped[slot].1.push(value.as_bytes().to_vec());
        }
    }

    SearchResultEntry {
        object_name: hit.entry.dn(base_dn).into(),
        attributes: grouped
            .into_iter()
            .map(|(name, values)| PartialAttribute {
                attr_type: name.into(),
                attr_vals: if req.types_only {
                    Vec::new()
                } else {
                    values
                        .into_iter()
                        .map(|v| crate::filter::AttributeValue(Cow::Owned(v)))
                        .collect()
                },
            })
            .collect(),
    }
}

/// Server metadata for the empty base DN, assembled from settings plus
/// vendor info
async fn root_dse(
    ctx: &RequestContext,
    req: &SearchRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;

    let requested: Vec<String> = if req.attributes.is_empty() {
        vec![
            "namingContexts".to_string(),
            "defaultNamingContext".to_string(),
            "vendorName".to_string(),
            "vendorVersion".to_string(),
            "supportedLDAPVersion".to_string(),
            "supportedExtension".to_string(),
        ]
    } else {
        req.attributes.iter().map(|a| a.0.to_string()).collect()
    };

    let mut attributes = Vec::new();
    for name in requested {
        let values: Vec<String> = match name.to_lowercase().as_str() {
            "namingcontexts" | "defaultnamingcontext" => vec![base_dn.clone()],
            "vendorname" => vec![ctx.config.vendor_name.clone()],
            "vendorversion" => vec![ctx.config.vendor_version.clone()],
            "supportedldapversion" => vec!["3".to_string()],
            "supportedextension" => vec![STARTTLS_OID.to_string()],
            "objectclass" => vec!["top".to_string()],
            _ => match ctx
                .store
                .get_setting(&name)
                .await
                .map_err(OperationError::from)?
            {
                Some(value) => vec![value],
                None => continue,
            },
        };
        attributes.push(PartialAttribute::from_values(name, values));
    }

    out.send(ProtocolOp::SearchResultEntry(SearchResultEntry {
        object_name: String::new().into(),
        attributes,
    }))
    .await?;
    out.send(ProtocolOp::SearchResultDone(LdapResult::success("")))
        .await?;
    Ok(())
}
