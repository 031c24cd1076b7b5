//! LDAP filter to store-predicate interpreter
//!
//! Both filter forms (the ASN.1 tree from Search requests and the RFC 4515
//! text form) compile to the backend-portable [`Predicate`]. Leaf routing:
//! indexed user/directory columns are matched directly, `objectCategory` is
//! rewritten to `objectClass`, `memberOf` resolves the target group by path
//! into a membership set, everything else goes through the attribute rows.

use crate::dn::dn_to_path;
use crate::error::OperationError;
use crate::filter::{Filter, Substring, SubstringFilter};
use crate::ldap::ResultCode;
use crate::store::{
    AttrValue, CompareOp, DirColumn, DirectoryStore, Predicate, SubstringChunk, UserColumn,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use tracing::warn;

static APPROX_WARNING: Once = Once::new();

pub struct FilterCompiler<'s> {
    store: &'s dyn DirectoryStore,
    base_dn: String,
    approx_as_inequality: bool,
}

impl<'s> FilterCompiler<'s> {
    pub fn new(store: &'s dyn DirectoryStore, base_dn: &str, approx_as_inequality: bool) -> Self {
        FilterCompiler {
            store,
            base_dn: base_dn.to_string(),
            approx_as_inequality,
        }
    }

    /// Compile an RFC 4515 string filter
    pub async fn compile_str(&self, filter: &str) -> Result<Predicate, OperationError> {
        let parsed = crate::filter_parser::parse_ldap_filter_str(filter)
            .map_err(|e| OperationError::protocol_error(format!("invalid filter: {e}")))?;
        self.compile(&parsed).await
    }

    /// Compile a filter tree, resolving `memberOf` targets through the store
    pub fn compile<'a>(
        &'a self,
        filter: &'a Filter<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<Predicate, OperationError>> + Send + 'a>> {
        Box::pin(async move {
            match filter {
                Filter::And(items) => {
                    let mut preds = Vec::with_capacity(items.len());
                    for item in items {
                        preds.push(self.compile(item).await?);
                    }
                    Ok(Predicate::And(preds))
                }
                Filter::Or(items) => {
                    let mut preds = Vec::with_capacity(items.len());
                    for item in items {
                        preds.push(self.compile(item).await?);
                    }
                    Ok(Predicate::Or(preds))
                }
                Filter::Not(inner) => {
                    Ok(Predicate::Not(Box::new(self.compile(inner).await?)))
                }
                Filter::EqualityMatch(ava) => {
                    self.leaf(&ava.attribute_desc.0, CompareOp::Eq, &ava.assertion_value)
                        .await
                }
                Filter::GreaterOrEqual(ava) => {
                    self.leaf(&ava.attribute_desc.0, CompareOp::Ge, &ava.assertion_value)
                        .await
                }
                Filter::LessOrEqual(ava) => {
                    self.leaf(&ava.attribute_desc.0, CompareOp::Le, &ava.assertion_value)
                        .await
                }
                Filter::ApproxMatch(ava) => {
                    let op = if self.approx_as_inequality {
                        APPROX_WARNING.call_once(|| {
                            warn!("approximate match (~=) is evaluated as inequality");
                        });
                        CompareOp::Ne
                    } else {
                        CompareOp::Eq
                    };
                    self.leaf(&ava.attribute_desc.0, op, &ava.assertion_value).await
                }
                Filter::Substrings(sub) => self.substring(sub),
                Filter::Present(attr) => Ok(self.present(&attr.0)),
                Filter::ExtensibleMatch(_) => Err(OperationError::new(
                    ResultCode::InappropriateMatching,
                    "extensible match is not supported",
                )),
            }
        })
    }

    fn attr_key(attr: &str) -> String {
        let attr = attr.to_lowercase();
        // objectCategory is an alias of objectClass here
        attr.replace("objectcategory", "objectclass")
    }

    async fn leaf(
        &self,
        attr: &str,
        op: CompareOp,
        value: &[u8],
    ) -> Result<Predicate, OperationError> {
        let attr = Self::attr_key(attr);

        if attr == "memberof" {
            let dn = std::str::from_utf8(value)
                .map_err(|_| OperationError::invalid_dn("memberOf value is not UTF-8"))?;
            let members = self.resolve_group_members(dn).await?;
            let pred = Predicate::MemberOf { members };
            return Ok(match op {
                CompareOp::Eq | CompareOp::Ge | CompareOp::Le => pred,
                CompareOp::Ne => Predicate::Not(Box::new(pred)),
            });
        }

        if let Some(column) = UserColumn::from_attr(&attr) {
            return Ok(Predicate::UserColumn {
                column,
                op,
                value: String::from_utf8_lossy(value).into_owned(),
            });
        }
        if let Some(column) = DirColumn::from_attr(&attr) {
            return Ok(Predicate::DirColumn {
                column,
                op,
                value: String::from_utf8_lossy(value).into_owned(),
            });
        }
        Ok(Predicate::Attr {
            name: attr,
            op,
            value: AttrValue::from_bytes(value),
        })
    }

    fn substring(&self, sub: &SubstringFilter<'_>) -> Result<Predicate, OperationError> {
        let attr = Self::attr_key(&sub.filter_type.0);
        let chunks = substring_chunks(sub)?;
        if let Some(column) = UserColumn::from_attr(&attr) {
            return Ok(Predicate::UserColumnSubstr { column, chunks });
        }
        if let Some(column) = DirColumn::from_attr(&attr) {
            return Ok(Predicate::DirColumnSubstr { column, chunks });
        }
        Ok(Predicate::AttrSubstr { name: attr, chunks })
    }

    fn present(&self, attr: &str) -> Predicate {
        let attr = Self::attr_key(attr);
        if let Some(column) = UserColumn::from_attr(&attr) {
            return Predicate::UserColumnPresent(column);
        }
        if let Some(column) = DirColumn::from_attr(&attr) {
            return Predicate::DirColumnPresent(column);
        }
        Predicate::AttrPresent(attr)
    }

    /// `memberOf=<dn>`: locate the group by path, produce the set of direct
    /// members (users and nested groups). An unknown group matches nothing.
    async fn resolve_group_members(&self, dn: &str) -> Result<Vec<i64>, OperationError> {
        let path = match dn_to_path(dn, &self.base_dn) {
            Some(path) if !path.is_empty() => path,
            _ => return Ok(Vec::new()),
        };
        let group = match self.store.find_by_path(&path).await? {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };
        Ok(self.store.group_members(group.id).await?)
    }
}

fn substring_chunks(sub: &SubstringFilter<'_>) -> Result<Vec<SubstringChunk>, OperationError> {
    let text = |v: &[u8]| -> Result<String, OperationError> {
        std::str::from_utf8(v)
            .map(str::to_string)
            .map_err(|_| OperationError::protocol_error("substring value is not UTF-8"))
    };
    sub.substrings
        .iter()
        .map(|chunk| {
            Ok(match chunk {
                Substring::Initial(v) => SubstringChunk::Initial(text(&v.0)?),
                Substring::Any(v) => SubstringChunk::Any(text(&v.0)?),
                Substring::Final(v) => SubstringChunk::Final(text(&v.0)?),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_parser::parse_ldap_filter_str;
    use crate::store::MemoryStore;

    async fn compile(filter: &str) -> Predicate {
        let store = MemoryStore::new("dc=md,dc=test");
        let compiler = FilterCompiler::new(&store, "dc=md,dc=test", true);
        let parsed = parse_ldap_filter_str(filter).expect("parse failed");
        compiler.compile(&parsed).await.expect("compile failed")
    }

    #[tokio::test]
    async fn routes_user_columns() {
        match compile("(sAMAccountName=user0)").await {
            Predicate::UserColumn { column, op, value } => {
                assert_eq!(column, UserColumn::SamAccountName);
                assert_eq!(op, CompareOp::Eq);
                assert_eq!(value, "user0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewrites_object_category() {
        match compile("(objectCategory=person)").await {
            Predicate::DirColumn { column, .. } => assert_eq!(column, DirColumn::ObjectClass),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_attrs_join_attribute_rows() {
        match compile("(telephoneNumber=55512*)").await {
            Predicate::AttrSubstr { name, chunks } => {
                assert_eq!(name, "telephonenumber");
                assert_eq!(chunks, vec![SubstringChunk::Initial("55512".into())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn approx_becomes_inequality() {
        match compile("(mail~=x@y)").await {
            Predicate::UserColumn { op, .. } => assert_eq!(op, CompareOp::Ne),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_member_of_group_matches_nothing() {
        match compile("(memberOf=cn=ghost,dc=md,dc=test)").await {
            Predicate::MemberOf { members } => assert!(members.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
