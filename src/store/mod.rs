//! Directory persistence contract
//!
//! Operation handlers never talk to a concrete backend: they consume the
//! [`DirectoryStore`] trait, which exposes path lookup, predicate search and
//! the atomic mutation operations. [`MemoryStore`] is the in-tree reference
//! implementation; a relational backend implements the same contract.

mod memory;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::BoxStream;
use ipnet::IpNet;

pub type EntryId = i64;

/// Seconds between 1601-01-01 and the unix epoch
const FILETIME_EPOCH_SHIFT: i64 = 11_644_473_600;

/// Convert to a Windows FILETIME value (100ns ticks since 1601)
pub fn datetime_to_filetime(dt: DateTime<Utc>) -> u64 {
    ((dt.timestamp() + FILETIME_EPOCH_SHIFT) as u64) * 10_000_000
}

pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    let secs = (ft / 10_000_000) as i64 - FILETIME_EPOCH_SHIFT;
    Utc.timestamp_opt(secs, 0).single()
}

/// LDAP generalized time (`YYYYmmddHHMMSSZ`)
pub fn generalized_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%SZ").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no such entry")]
    NoSuchEntry,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("entry has subordinates")]
    NotLeaf,
    #[error("attribute or value exists")]
    AttributeOrValueExists,
    #[error("no such attribute")]
    NoSuchAttribute,
    #[error("membership cycle")]
    MembershipCycle,
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// One node of the directory tree with its materialised path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    pub object_class: String,
    /// Plain entry name (the RDN value), e.g. `user0` for `cn=user0`
    pub name: String,
    pub depth: u32,
    pub object_sid: String,
    pub object_guid: Option<String>,
    pub when_created: DateTime<Utc>,
    pub when_changed: DateTime<Utc>,
    /// RDN components from the naming-context root down to this entry
    pub path: Vec<String>,
}

impl DirectoryEntry {
    /// Full DN under the given naming context
    pub fn dn(&self, base_dn: &str) -> String {
        if self.path.is_empty() {
            return base_dn.to_string();
        }
        let mut parts: Vec<&str> = self.path.iter().map(String::as_str).collect();
        parts.reverse();
        format!("{},{}", parts.join(","), base_dn)
    }

    /// Full RDN, e.g. `cn=user0`; `None` for the naming-context root
    pub fn rdn(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttrValue {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(s) => AttrValue::Text(s.to_string()),
            Err(_) => AttrValue::Binary(bytes.to_vec()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            AttrValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttrValue::Text(s) => s.as_bytes(),
            AttrValue::Binary(b) => b,
        }
    }
}

/// Multi-valued attribute row; names keep their LDAP casing, comparisons are
/// case-insensitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttribute {
    pub name: String,
    pub value: AttrValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub directory_id: EntryId,
    pub sam_account_name: String,
    pub user_principal_name: String,
    pub display_name: String,
    pub mail: String,
    pub password_hash: String,
    pub last_logon: Option<DateTime<Utc>>,
    pub account_expires: Option<DateTime<Utc>>,
    /// Previous password hashes, newest last
    pub password_history: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub sam_account_name: String,
    pub user_principal_name: String,
    pub display_name: String,
    pub mail: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub parent: EntryId,
    /// Relative name, e.g. `cn=test`
    pub name: String,
    pub object_class: String,
    pub attributes: Vec<StoredAttribute>,
    /// Directory ids of groups this entry is a member of
    pub member_of: Vec<EntryId>,
    pub user: Option<NewUser>,
}

/// Searchable columns on the user side table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserColumn {
    SamAccountName,
    UserPrincipalName,
    DisplayName,
    Mail,
    LastLogon,
    AccountExpires,
}

impl UserColumn {
    /// Resolve an LDAP attribute name (already lowercased) to a column
    pub fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "samaccountname" => Some(UserColumn::SamAccountName),
            "userprincipalname" => Some(UserColumn::UserPrincipalName),
            "displayname" => Some(UserColumn::DisplayName),
            "mail" => Some(UserColumn::Mail),
            "lastlogon" => Some(UserColumn::LastLogon),
            "accountexpires" => Some(UserColumn::AccountExpires),
            _ => None,
        }
    }

    pub fn attr_name(&self) -> &'static str {
        match self {
            UserColumn::SamAccountName => "sAMAccountName",
            UserColumn::UserPrincipalName => "userPrincipalName",
            UserColumn::DisplayName => "displayName",
            UserColumn::Mail => "mail",
            UserColumn::LastLogon => "lastLogon",
            UserColumn::AccountExpires => "accountExpires",
        }
    }
}

/// Searchable columns on the directory table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirColumn {
    Name,
    ObjectClass,
    ObjectSid,
    ObjectGuid,
    WhenCreated,
    WhenChanged,
}

impl DirColumn {
    pub fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "name" => Some(DirColumn::Name),
            "objectclass" => Some(DirColumn::ObjectClass),
            "objectsid" => Some(DirColumn::ObjectSid),
            "objectguid" => Some(DirColumn::ObjectGuid),
            "whencreated" => Some(DirColumn::WhenCreated),
            "whenchanged" => Some(DirColumn::WhenChanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ge,
    Le,
    /// `~=` mapped to inequality (configurable deviation, see DESIGN.md)
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstringChunk {
    Initial(String),
    Any(String),
    Final(String),
}

/// Case-insensitive substring match preserving initial/any/final positions
pub fn substring_match(chunks: &[SubstringChunk], value: &str) -> bool {
    let haystack = value.to_lowercase();
    let mut pos = 0usize;
    for chunk in chunks {
        match chunk {
            SubstringChunk::Initial(s) => {
                let needle = s.to_lowercase();
                if !haystack.starts_with(&needle) {
                    return false;
                }
                pos = needle.len();
            }
            SubstringChunk::Any(s) => {
                let needle = s.to_lowercase();
                let rest = match haystack.get(pos..) {
                    Some(rest) => rest,
                    None => return false,
                };
                match rest.find(&needle) {
                    Some(off) => pos = pos + off + needle.len(),
                    None => return false,
                }
            }
            SubstringChunk::Final(s) => {
                let needle = s.to_lowercase();
                if !haystack.ends_with(&needle) || haystack.len() < pos + needle.len() {
                    return false;
                }
            }
        }
    }
    true
}

/// Backend-portable search predicate compiled from an LDAP filter
#[derive(Debug, Clone)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    UserColumn {
        column: UserColumn,
        op: CompareOp,
        value: String,
    },
    UserColumnPresent(UserColumn),
    UserColumnSubstr {
        column: UserColumn,
        chunks: Vec<SubstringChunk>,
    },
    DirColumn {
        column: DirColumn,
        op: CompareOp,
        value: String,
    },
    DirColumnPresent(DirColumn),
    DirColumnSubstr {
        column: DirColumn,
        chunks: Vec<SubstringChunk>,
    },
    /// Outer join against the attribute rows, compared case-insensitively
    Attr {
        name: String,
        op: CompareOp,
        value: AttrValue,
    },
    AttrSubstr {
        name: String,
        chunks: Vec<SubstringChunk>,
    },
    AttrPresent(String),
    /// Entry is a direct member (user or nested group) of the resolved group
    MemberOf { members: Vec<EntryId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
    SubordinateSubtree,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub base: EntryId,
    pub scope: Scope,
    pub predicate: Predicate,
}

/// One streamed search row with materialised attributes
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: DirectoryEntry,
    pub attributes: Vec<StoredAttribute>,
    pub user: Option<UserRecord>,
}

/// Store-level rendition of one Modify change; the handler has already
/// resolved group DNs and validated password policy
#[derive(Debug, Clone)]
pub enum AttrChange {
    AddValues {
        name: String,
        values: Vec<AttrValue>,
    },
    /// Delete the whole attribute
    DeleteAttribute { name: String },
    DeleteValues {
        name: String,
        values: Vec<AttrValue>,
    },
    /// Atomic delete-then-add
    Replace {
        name: String,
        values: Vec<AttrValue>,
    },
    AddGroups { groups: Vec<EntryId> },
    /// `None` clears all membership
    RemoveGroups { groups: Option<Vec<EntryId>> },
    /// Updates the hash, records history and resets `pwdLastSet`
    SetPassword { hash: String },
}

#[derive(Debug, Clone)]
pub struct NetworkPolicyRecord {
    pub id: i64,
    pub name: String,
    pub network: IpNet,
    pub enabled: bool,
    pub priority: u32,
    /// Group names allowed to bind; empty means any authenticated user
    pub groups: Vec<String>,
    pub mfa_required: bool,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicyRecord {
    pub name: String,
    pub history_length: u32,
    pub maximum_age_days: u32,
    pub minimum_age_days: u32,
    pub minimum_length: u32,
    pub complexity_required: bool,
}

impl Default for PasswordPolicyRecord {
    fn default() -> Self {
        PasswordPolicyRecord {
            name: "Default domain password policy".to_string(),
            history_length: 4,
            maximum_age_days: 0,
            minimum_age_days: 0,
            minimum_length: 7,
            complexity_required: true,
        }
    }
}

impl PasswordPolicyRecord {
    /// `minimum_age_days <= maximum_age_days`, bounds per the data model
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.history_length > 24
            || self.maximum_age_days > 999
            || self.minimum_age_days > 999
            || self.minimum_length > 256
        {
            return Err(StoreError::Constraint("password policy out of bounds".into()));
        }
        if self.maximum_age_days != 0 && self.minimum_age_days > self.maximum_age_days {
            return Err(StoreError::Constraint(
                "minimum password age must not exceed maximum password age".into(),
            ));
        }
        Ok(())
    }
}

/// The directory persistence contract consumed by the operation handlers
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    // server-level settings (CatalogueSetting)
    async fn get_setting(&self, name: &str) -> Result<Option<String>, StoreError>;
    async fn set_setting(&self, name: &str, value: &str) -> Result<(), StoreError>;
    async fn base_dn(&self) -> Result<String, StoreError>;

    // path-based lookup
    async fn find_by_path(&self, path: &[String]) -> Result<Option<DirectoryEntry>, StoreError>;
    async fn entry(&self, id: EntryId) -> Result<DirectoryEntry, StoreError>;
    async fn entry_attributes(&self, id: EntryId) -> Result<Vec<StoredAttribute>, StoreError>;
    async fn has_children(&self, id: EntryId) -> Result<bool, StoreError>;

    /// Streamed predicate search; the consumer must not assume the full
    /// result set is buffered
    async fn search(
        &self,
        query: SearchQuery,
    ) -> Result<BoxStream<'static, Result<SearchHit, StoreError>>, StoreError>;

    // mutations, each atomic
    async fn add_entry(&self, new: NewEntry) -> Result<DirectoryEntry, StoreError>;
    async fn apply_changes(&self, id: EntryId, changes: Vec<AttrChange>)
        -> Result<(), StoreError>;
    async fn rename_entry(
        &self,
        id: EntryId,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_parent: Option<EntryId>,
    ) -> Result<(), StoreError>;
    async fn delete_entry(&self, id: EntryId) -> Result<(), StoreError>;

    // users and groups
    async fn user_by_upn(&self, upn: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn user_by_sam(&self, sam: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn user_by_directory(&self, id: EntryId) -> Result<Option<UserRecord>, StoreError>;
    async fn user_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;
    /// Transitive group closure, bounded by `depth_limit`
    async fn user_groups(
        &self,
        user_directory: EntryId,
        depth_limit: u32,
    ) -> Result<Vec<DirectoryEntry>, StoreError>;
    /// Direct members of a group: user directories and nested group directories
    async fn group_members(&self, group_directory: EntryId) -> Result<Vec<EntryId>, StoreError>;
    async fn record_logon(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    // policies
    async fn network_policies(&self) -> Result<Vec<NetworkPolicyRecord>, StoreError>;
    async fn password_policy(&self) -> Result<PasswordPolicyRecord, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_positions_are_preserved() {
        let chunks = vec![
            SubstringChunk::Initial("user".into()),
            SubstringChunk::Any("0".into()),
        ];
        assert!(substring_match(&chunks, "User01"));
        assert!(!substring_match(&chunks, "0user"));

        let chunks = vec![SubstringChunk::Final("admin".into())];
        assert!(substring_match(&chunks, "cn-Admin"));
        assert!(!substring_match(&chunks, "admins"));
    }

    #[test]
    fn filetime_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ft = datetime_to_filetime(dt);
        assert_eq!(filetime_to_datetime(ft), Some(dt));
    }

    #[test]
    fn password_policy_age_invariant() {
        let mut policy = PasswordPolicyRecord::default();
        policy.maximum_age_days = 10;
        policy.minimum_age_days = 20;
        assert!(policy.validate().is_err());
        policy.minimum_age_days = 5;
        assert!(policy.validate().is_ok());
    }
}
