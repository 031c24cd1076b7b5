//! In-memory reference implementation of the store contract
//!
//! Backs the default binary wiring and the test-suite. Mutations run on a
//! snapshot that replaces the live state only on success, which gives every
//! trait operation all-or-nothing semantics (the contract's transactional
//! unit of work, including Modify's nested replace).

use super::*;
use crate::dn::rdn_pair;
use chrono::{DateTime, Utc};
use futures::stream;
use futures::StreamExt;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct EntryRow {
    entry: DirectoryEntry,
    attributes: Vec<StoredAttribute>,
}

#[derive(Debug, Clone, Default)]
struct GroupRow {
    /// Directory ids of direct members, users and nested groups alike
    members: HashSet<EntryId>,
}

#[derive(Debug, Clone)]
struct Inner {
    base_dn: String,
    settings: HashMap<String, String>,
    next_entry_id: EntryId,
    next_user_id: i64,
    entries: BTreeMap<EntryId, EntryRow>,
    path_index: HashMap<Vec<String>, EntryId>,
    users: BTreeMap<i64, UserRecord>,
    users_by_dir: HashMap<EntryId, i64>,
    groups: HashMap<EntryId, GroupRow>,
    computers: HashSet<EntryId>,
    network_policies: Vec<NetworkPolicyRecord>,
    password_policy: PasswordPolicyRecord,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

pub(crate) const ROOT_ID: EntryId = 1;

impl MemoryStore {
    pub fn new(base_dn: &str) -> Self {
        let base_dn = crate::dn::normalize_dn(base_dn);
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let domain_sid = format!(
            "S-1-5-21-{}-{}-{}",
            rng.gen::<u32>(),
            rng.gen::<u32>(),
            rng.gen::<u32>()
        );
        let domain_guid = uuid::Uuid::new_v4().to_string();

        let root = DirectoryEntry {
            id: ROOT_ID,
            parent_id: None,
            object_class: "domain".to_string(),
            name: base_dn.clone(),
            depth: 0,
            object_sid: domain_sid.clone(),
            object_guid: Some(domain_guid.clone()),
            when_created: now,
            when_changed: now,
            path: Vec::new(),
        };
        let root_row = EntryRow {
            entry: root,
            attributes: vec![
                StoredAttribute {
                    name: "objectClass".to_string(),
                    value: AttrValue::Text("domain".to_string()),
                },
                StoredAttribute {
                    name: "objectClass".to_string(),
                    value: AttrValue::Text("top".to_string()),
                },
            ],
        };

        let mut settings = HashMap::new();
        settings.insert("defaultNamingContext".to_string(), base_dn.clone());
        settings.insert("objectSid".to_string(), domain_sid);
        settings.insert("objectGUID".to_string(), domain_guid);

        let mut entries = BTreeMap::new();
        entries.insert(ROOT_ID, root_row);
        let mut path_index = HashMap::new();
        path_index.insert(Vec::new(), ROOT_ID);

        MemoryStore {
            inner: RwLock::new(Inner {
                base_dn,
                settings,
                next_entry_id: ROOT_ID + 1,
                next_user_id: 1,
                entries,
                path_index,
                users: BTreeMap::new(),
                users_by_dir: HashMap::new(),
                groups: HashMap::new(),
                computers: HashSet::new(),
                network_policies: Vec::new(),
                password_policy: PasswordPolicyRecord::default(),
            }),
        }
    }

    /// Install network policies (admin surface is out of scope, tests and
    /// bootstrap code use this directly)
    pub async fn set_network_policies(&self, policies: Vec<NetworkPolicyRecord>) {
        self.inner.write().await.network_policies = policies;
    }

    pub async fn set_password_policy(
        &self,
        policy: PasswordPolicyRecord,
    ) -> Result<(), StoreError> {
        policy.validate()?;
        self.inner.write().await.password_policy = policy;
        Ok(())
    }

    /// Run a mutation on a snapshot; the live state is replaced only when the
    /// whole closure succeeds
    async fn txn<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self.inner.write().await;
        let mut copy = guard.clone();
        let out = f(&mut copy)?;
        *guard = copy;
        Ok(out)
    }
}

impl Inner {
    fn row(&self, id: EntryId) -> Result<&EntryRow, StoreError> {
        self.entries.get(&id).ok_or(StoreError::NoSuchEntry)
    }

    fn row_mut(&mut self, id: EntryId) -> Result<&mut EntryRow, StoreError> {
        self.entries.get_mut(&id).ok_or(StoreError::NoSuchEntry)
    }

    fn children(&self, id: EntryId) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|row| row.entry.parent_id == Some(id))
            .map(|row| row.entry.id)
            .collect()
    }

    fn rebuild_path_index(&mut self) {
        self.path_index = self
            .entries
            .values()
            .map(|row| (row.entry.path.clone(), row.entry.id))
            .collect();
    }

    fn domain_sid(&self) -> String {
        self.settings
            .get("objectSid")
            .cloned()
            .unwrap_or_else(|| "S-1-5-21-0-0-0".to_string())
    }

    /// Would inserting `child` into `parent`'s member set close a cycle
    fn creates_cycle(&self, parent: EntryId, child: EntryId) -> bool {
        if parent == child {
            return true;
        }
        // walk downward from the child; finding the parent below it means
        // the new edge would close a loop
        let mut seen = HashSet::new();
        let mut stack = vec![child];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(group) = self.groups.get(&current) {
                for &member in &group.members {
                    if member == parent {
                        return true;
                    }
                    stack.push(member);
                }
            }
        }
        false
    }

    fn add_membership(&mut self, group_dir: EntryId, member_dir: EntryId) -> Result<(), StoreError> {
        if self.groups.contains_key(&member_dir) && self.creates_cycle(group_dir, member_dir) {
            return Err(StoreError::MembershipCycle);
        }
        match self.groups.get_mut(&group_dir) {
            Some(group) => {
                group.members.insert(member_dir);
                Ok(())
            }
            None => Err(StoreError::Constraint("target is not a group".to_string())),
        }
    }

    fn user_for_entry(&self, dir: EntryId) -> Option<&UserRecord> {
        self.users_by_dir.get(&dir).and_then(|uid| self.users.get(uid))
    }

    fn set_user_column(
        &mut self,
        dir: EntryId,
        column: UserColumn,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        let uid = *self
            .users_by_dir
            .get(&dir)
            .ok_or_else(|| StoreError::Constraint("entry has no user account".to_string()))?;
        let user = self.users.get_mut(&uid).ok_or(StoreError::NoSuchEntry)?;
        let value_or_empty = value.unwrap_or("").to_string();
        match column {
            UserColumn::SamAccountName => user.sam_account_name = value_or_empty,
            UserColumn::UserPrincipalName => user.user_principal_name = value_or_empty,
            UserColumn::DisplayName => user.display_name = value_or_empty,
            UserColumn::Mail => user.mail = value_or_empty,
            UserColumn::LastLogon => {
                user.last_logon = value
                    .and_then(|v| v.parse::<u64>().ok())
                    .and_then(filetime_to_datetime);
            }
            UserColumn::AccountExpires => {
                user.account_expires = value
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|&ft| ft != 0)
                    .and_then(filetime_to_datetime);
            }
        }
        Ok(())
    }

    fn eval(&self, row: &EntryRow, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(items) => items.iter().all(|p| self.eval(row, p)),
            Predicate::Or(items) => items.iter().any(|p| self.eval(row, p)),
            Predicate::Not(inner) => !self.eval(row, inner),
            Predicate::UserColumn { column, op, value } => {
                match self.user_for_entry(row.entry.id) {
                    Some(user) => compare_user_column(user, *column, *op, value),
                    None => false,
                }
            }
            Predicate::UserColumnPresent(column) => match self.user_for_entry(row.entry.id) {
                Some(user) => user_column_text(user, *column).is_some(),
                None => false,
            },
            Predicate::UserColumnSubstr { column, chunks } => {
                match self.user_for_entry(row.entry.id) {
                    Some(user) => user_column_text(user, *column)
                        .map(|text| substring_match(chunks, &text))
                        .unwrap_or(false),
                    None => false,
                }
            }
            Predicate::DirColumn { column, op, value } => {
                match dir_column_text(&row.entry, *column) {
                    Some(text) => compare_text(*op, &text, value),
                    None => false,
                }
            }
            Predicate::DirColumnPresent(column) => dir_column_text(&row.entry, *column).is_some(),
            Predicate::DirColumnSubstr { column, chunks } => {
                match dir_column_text(&row.entry, *column) {
                    Some(text) => substring_match(chunks, &text),
                    None => false,
                }
            }
            Predicate::Attr { name, op, value } => row.attributes.iter().any(|attr| {
                if !attr.name.eq_ignore_ascii_case(name) {
                    return false;
                }
                match (&attr.value, value) {
                    (AttrValue::Text(have), AttrValue::Text(want)) => {
                        compare_text(*op, have, want)
                    }
                    (AttrValue::Binary(have), AttrValue::Binary(want)) => match op {
                        CompareOp::Eq => have == want,
                        CompareOp::Ne => have != want,
                        _ => false,
                    },
                    _ => false,
                }
            }),
            Predicate::AttrSubstr { name, chunks } => row.attributes.iter().any(|attr| {
                attr.name.eq_ignore_ascii_case(name)
                    && attr
                        .value
                        .as_text()
                        .map(|text| substring_match(chunks, text))
                        .unwrap_or(false)
            }),
            Predicate::AttrPresent(name) => row
                .attributes
                .iter()
                .any(|attr| attr.name.eq_ignore_ascii_case(name)),
            Predicate::MemberOf { members } => members.contains(&row.entry.id),
        }
    }

    /// Stored rows plus the operational attributes a search result carries
    fn materialize(&self, row: &EntryRow) -> SearchHit {
        let entry = &row.entry;
        let mut attributes = row.attributes.clone();
        let mut push = |name: &str, value: String| {
            attributes.push(StoredAttribute {
                name: name.to_string(),
                value: AttrValue::Text(value),
            });
        };
        push("objectSid", entry.object_sid.clone());
        if let Some(guid) = &entry.object_guid {
            push("objectGUID", guid.clone());
        }
        push("whenCreated", generalized_time(entry.when_created));
        push("whenChanged", generalized_time(entry.when_changed));

        // direct group membership, rendered as DNs
        for (group_dir, group) in &self.groups {
            if group.members.contains(&entry.id) {
                if let Some(group_row) = self.entries.get(group_dir) {
                    push("memberOf", group_row.entry.dn(&self.base_dn));
                }
            }
        }

        let user = self.user_for_entry(entry.id).cloned();
        if let Some(user) = &user {
            push("sAMAccountName", user.sam_account_name.clone());
            push("userPrincipalName", user.user_principal_name.clone());
            if !user.display_name.is_empty() {
                push("displayName", user.display_name.clone());
            }
            if !user.mail.is_empty() {
                push("mail", user.mail.clone());
            }
            if let Some(last_logon) = user.last_logon {
                push("lastLogon", datetime_to_filetime(last_logon).to_string());
            }
            if let Some(expires) = user.account_expires {
                push("accountExpires", datetime_to_filetime(expires).to_string());
            }
        }

        SearchHit {
            entry: entry.clone(),
            attributes,
            user,
        }
    }

    fn remove_memberships_of(&mut self, dir: EntryId) {
        for group in self.groups.values_mut() {
            group.members.remove(&dir);
        }
    }
}

fn compare_text(op: CompareOp, have: &str, want: &str) -> bool {
    let have = have.to_lowercase();
    let want = want.to_lowercase();
    match op {
        CompareOp::Eq => have == want,
        CompareOp::Ne => have != want,
        CompareOp::Ge => have >= want,
        CompareOp::Le => have <= want,
    }
}

fn compare_filetime(op: CompareOp, have: Option<DateTime<Utc>>, want: &str) -> bool {
    let have = match have {
        Some(dt) => datetime_to_filetime(dt),
        None => return false,
    };
    let want = match want.parse::<u64>() {
        Ok(v) => v,
        Err(_) => return false,
    };
    match op {
        CompareOp::Eq => have == want,
        CompareOp::Ne => have != want,
        CompareOp::Ge => have >= want,
        CompareOp::Le => have <= want,
    }
}

fn compare_user_column(user: &UserRecord, column: UserColumn, op: CompareOp, value: &str) -> bool {
    match column {
        UserColumn::LastLogon => compare_filetime(op, user.last_logon, value),
        UserColumn::AccountExpires => compare_filetime(op, user.account_expires, value),
        _ => match user_column_text(user, column) {
            Some(text) => compare_text(op, &text, value),
            None => false,
        },
    }
}

fn user_column_text(user: &UserRecord, column: UserColumn) -> Option<String> {
    match column {
        UserColumn::SamAccountName => Some(user.sam_account_name.clone()),
        UserColumn::UserPrincipalName => Some(user.user_principal_name.clone()),
        UserColumn::DisplayName => Some(user.display_name.clone()),
        UserColumn::Mail => Some(user.mail.clone()),
        UserColumn::LastLogon => user.last_logon.map(|dt| datetime_to_filetime(dt).to_string()),
        UserColumn::AccountExpires => user
            .account_expires
            .map(|dt| datetime_to_filetime(dt).to_string()),
    }
}

fn dir_column_text(entry: &DirectoryEntry, column: DirColumn) -> Option<String> {
    match column {
        DirColumn::Name => Some(entry.name.clone()),
        DirColumn::ObjectClass => Some(entry.object_class.clone()),
        DirColumn::ObjectSid => Some(entry.object_sid.clone()),
        DirColumn::ObjectGuid => entry.object_guid.clone(),
        DirColumn::WhenCreated => Some(generalized_time(entry.when_created)),
        DirColumn::WhenChanged => Some(generalized_time(entry.when_changed)),
    }
}

#[async_trait::async_trait]
impl DirectoryStore for MemoryStore {
    async fn get_setting(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.settings.get(name).cloned())
    }

    async fn set_setting(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .settings
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn base_dn(&self) -> Result<String, StoreError> {
        Ok(self.inner.read().await.base_dn.clone())
    }

    async fn find_by_path(&self, path: &[String]) -> Result<Option<DirectoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        let key: Vec<String> = path.iter().map(|p| p.to_lowercase()).collect();
        Ok(inner
            .path_index
            .get(&key)
            .and_then(|id| inner.entries.get(id))
            .map(|row| row.entry.clone()))
    }

    async fn entry(&self, id: EntryId) -> Result<DirectoryEntry, StoreError> {
        Ok(self.inner.read().await.row(id)?.entry.clone())
    }

    async fn entry_attributes(&self, id: EntryId) -> Result<Vec<StoredAttribute>, StoreError> {
        Ok(self.inner.read().await.row(id)?.attributes.clone())
    }

    async fn has_children(&self, id: EntryId) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        inner.row(id)?;
        Ok(inner
            .entries
            .values()
            .any(|row| row.entry.parent_id == Some(id)))
    }

    async fn search(
        &self,
        query: SearchQuery,
    ) -> Result<BoxStream<'static, Result<SearchHit, StoreError>>, StoreError> {
        let inner = self.inner.read().await;
        let base = inner.row(query.base)?.entry.clone();

        let candidates: Vec<&EntryRow> = inner
            .entries
            .values()
            .filter(|row| match query.scope {
                Scope::Base => row.entry.id == base.id,
                Scope::OneLevel => row.entry.parent_id == Some(base.id),
                Scope::Subtree => row.entry.path.starts_with(&base.path),
                Scope::SubordinateSubtree => {
                    row.entry.id != base.id && row.entry.path.starts_with(&base.path)
                }
            })
            .collect();

        // everything is resident, so the stream is materialised up front; the
        // trait contract stays lazy for backends that are not
        let hits: Vec<Result<SearchHit, StoreError>> = candidates
            .into_iter()
            .filter(|row| inner.eval(row, &query.predicate))
            .map(|row| Ok(inner.materialize(row)))
            .collect();
        Ok(stream::iter(hits).boxed())
    }

    async fn add_entry(&self, new: NewEntry) -> Result<DirectoryEntry, StoreError> {
        self.txn(move |inner| {
            let parent = inner.row(new.parent)?.entry.clone();
            let (rdn_attr, rdn_value) = rdn_pair(&new.name)
                .ok_or_else(|| StoreError::Constraint("invalid RDN".to_string()))?;
            let rdn_attr = rdn_attr.to_string();
            let rdn_value = rdn_value.to_string();

            let mut path = parent.path.clone();
            path.push(new.name.to_lowercase());
            if inner.path_index.contains_key(&path) {
                return Err(StoreError::AlreadyExists);
            }

            let id = inner.next_entry_id;
            inner.next_entry_id += 1;
            let now = Utc::now();
            let entry = DirectoryEntry {
                id,
                parent_id: Some(parent.id),
                object_class: new.object_class.clone(),
                name: rdn_value.clone(),
                depth: parent.depth + 1,
                object_sid: format!("{}-{}", inner.domain_sid(), 1000 + id),
                object_guid: Some(uuid::Uuid::new_v4().to_string()),
                when_created: now,
                when_changed: now,
                path: path.clone(),
            };

            let mut attributes = new.attributes.clone();
            // the RDN is searchable as a plain attribute as well
            attributes.push(StoredAttribute {
                name: rdn_attr,
                value: AttrValue::Text(rdn_value),
            });

            inner.path_index.insert(path, id);
            inner.entries.insert(id, EntryRow { entry, attributes });

            match new.object_class.as_str() {
                "group" => {
                    inner.groups.insert(id, GroupRow::default());
                }
                "computer" => {
                    inner.computers.insert(id);
                }
                _ => {}
            }

            if let Some(new_user) = &new.user {
                let duplicate = inner.users.values().any(|u| {
                    u.sam_account_name
                        .eq_ignore_ascii_case(&new_user.sam_account_name)
                        || u.user_principal_name
                            .eq_ignore_ascii_case(&new_user.user_principal_name)
                });
                if duplicate {
                    return Err(StoreError::Constraint(
                        "sAMAccountName and userPrincipalName must be unique".to_string(),
                    ));
                }
                let uid = inner.next_user_id;
                inner.next_user_id += 1;
                inner.users.insert(
                    uid,
                    UserRecord {
                        id: uid,
                        directory_id: id,
                        sam_account_name: new_user.sam_account_name.clone(),
                        user_principal_name: new_user.user_principal_name.clone(),
                        display_name: new_user.display_name.clone(),
                        mail: new_user.mail.clone(),
                        password_hash: new_user.password_hash.clone(),
                        last_logon: None,
                        account_expires: None,
                        password_history: Vec::new(),
                    },
                );
                inner.users_by_dir.insert(id, uid);
            }

            for &group_dir in &new.member_of {
                inner.add_membership(group_dir, id)?;
            }

            Ok(inner.row(id)?.entry.clone())
        })
        .await
    }

    async fn apply_changes(
        &self,
        id: EntryId,
        changes: Vec<AttrChange>,
    ) -> Result<(), StoreError> {
        self.txn(move |inner| {
            inner.row(id)?;
            for change in &changes {
                apply_one_change(inner, id, change)?;
            }
            inner.row_mut(id)?.entry.when_changed = Utc::now();
            Ok(())
        })
        .await
    }

    async fn rename_entry(
        &self,
        id: EntryId,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_parent: Option<EntryId>,
    ) -> Result<(), StoreError> {
        let new_rdn = new_rdn.to_string();
        self.txn(move |inner| {
            let entry = inner.row(id)?.entry.clone();
            let Some(current_parent) = entry.parent_id else {
                return Err(StoreError::Constraint(
                    "the naming context root cannot be renamed".to_string(),
                ));
            };
            let parent_id = new_parent.unwrap_or(current_parent);
            let parent = inner.row(parent_id)?.entry.clone();
            let (new_attr, new_value) = rdn_pair(&new_rdn)
                .ok_or_else(|| StoreError::Constraint("invalid new RDN".to_string()))?;
            let new_attr = new_attr.to_string();
            let new_value = new_value.to_string();

            if parent.path.starts_with(&entry.path) {
                return Err(StoreError::Constraint(
                    "cannot move an entry under itself".to_string(),
                ));
            }

            let old_path = entry.path.clone();
            let mut new_path = parent.path.clone();
            new_path.push(new_rdn.to_lowercase());
            if let Some(&existing) = inner.path_index.get(&new_path) {
                if existing != id {
                    return Err(StoreError::AlreadyExists);
                }
            }

            let old_rdn = entry.rdn().map(str::to_string);

            // rewrite the subtree: this entry plus every descendant path
            let affected: Vec<EntryId> = inner
                .entries
                .values()
                .filter(|row| row.entry.path.starts_with(&old_path))
                .map(|row| row.entry.id)
                .collect();
            for affected_id in affected {
                let row = inner.row_mut(affected_id)?;
                let suffix = row.entry.path[old_path.len()..].to_vec();
                let mut path = new_path.clone();
                path.extend(suffix);
                row.entry.depth = path.len() as u32;
                row.entry.path = path;
                row.entry.when_changed = Utc::now();
            }

            {
                let row = inner.row_mut(id)?;
                row.entry.parent_id = Some(parent_id);
                row.entry.name = new_value.clone();

                if let Some(old_rdn) = old_rdn {
                    if let Some((old_attr, old_value)) = rdn_pair(&old_rdn) {
                        let old_attr = old_attr.to_string();
                        let old_value = old_value.to_string();
                        if delete_old_rdn {
                            row.attributes.retain(|attr| {
                                !(attr.name.eq_ignore_ascii_case(&old_attr)
                                    && attr.value.as_text().map(str::to_lowercase)
                                        == Some(old_value.to_lowercase()))
                            });
                        }
                    }
                }
                let already_there = row.attributes.iter().any(|attr| {
                    attr.name.eq_ignore_ascii_case(&new_attr)
                        && attr.value.as_text().map(str::to_lowercase)
                            == Some(new_value.to_lowercase())
                });
                if !already_there {
                    row.attributes.push(StoredAttribute {
                        name: new_attr,
                        value: AttrValue::Text(new_value),
                    });
                }
            }

            inner.rebuild_path_index();
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, id: EntryId) -> Result<(), StoreError> {
        self.txn(move |inner| {
            inner.row(id)?;
            if !inner.children(id).is_empty() {
                return Err(StoreError::NotLeaf);
            }
            let Some(row) = inner.entries.remove(&id) else {
                return Err(StoreError::NoSuchEntry);
            };
            inner.path_index.remove(&row.entry.path);
            if let Some(uid) = inner.users_by_dir.remove(&id) {
                inner.users.remove(&uid);
            }
            inner.groups.remove(&id);
            inner.computers.remove(&id);
            inner.remove_memberships_of(id);
            Ok(())
        })
        .await
    }

    async fn user_by_upn(&self, upn: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.user_principal_name.eq_ignore_ascii_case(upn))
            .cloned())
    }

    async fn user_by_sam(&self, sam: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.sam_account_name.eq_ignore_ascii_case(sam))
            .cloned())
    }

    async fn user_by_directory(&self, id: EntryId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.inner.read().await.user_for_entry(id).cloned())
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn user_groups(
        &self,
        user_directory: EntryId,
        depth_limit: u32,
    ) -> Result<Vec<DirectoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<EntryId> = Vec::new();
        let mut seen: HashSet<EntryId> = HashSet::new();
        let mut frontier = vec![user_directory];
        for _ in 0..depth_limit {
            let mut next = Vec::new();
            for &member in &frontier {
                for (&group_dir, group) in &inner.groups {
                    if group.members.contains(&member) && seen.insert(group_dir) {
                        found.push(group_dir);
                        next.push(group_dir);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(found
            .into_iter()
            .filter_map(|id| inner.entries.get(&id))
            .map(|row| row.entry.clone())
            .collect())
    }

    async fn group_members(&self, group_directory: EntryId) -> Result<Vec<EntryId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .groups
            .get(&group_directory)
            .map(|group| group.members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn record_logon(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NoSuchEntry)?;
        user.last_logon = Some(at);
        Ok(())
    }

    async fn network_policies(&self) -> Result<Vec<NetworkPolicyRecord>, StoreError> {
        Ok(self.inner.read().await.network_policies.clone())
    }

    async fn password_policy(&self) -> Result<PasswordPolicyRecord, StoreError> {
        Ok(self.inner.read().await.password_policy.clone())
    }
}

fn apply_one_change(inner: &mut Inner, id: EntryId, change: &AttrChange) -> Result<(), StoreError> {
    match change {
        AttrChange::AddValues { name, values } => {
            let key = name.to_lowercase();
            if let Some(column) = UserColumn::from_attr(&key) {
                let value = values.first().and_then(|v| v.as_text());
                return inner.set_user_column(id, column, value);
            }
            if DirColumn::from_attr(&key) == Some(DirColumn::ObjectClass) {
                if let Some(value) = values.first().and_then(|v| v.as_text()) {
                    inner.row_mut(id)?.entry.object_class = value.to_string();
                }
            }
            let row = inner.row_mut(id)?;
            for value in values {
                let duplicate = row
                    .attributes
                    .iter()
                    .any(|attr| attr.name.eq_ignore_ascii_case(&key) && attr.value == *value);
                if duplicate {
                    return Err(StoreError::AttributeOrValueExists);
                }
                row.attributes.push(StoredAttribute {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            Ok(())
        }
        AttrChange::DeleteAttribute { name } => {
            let key = name.to_lowercase();
            let row = inner.row_mut(id)?;
            let before = row.attributes.len();
            row.attributes
                .retain(|attr| !attr.name.eq_ignore_ascii_case(&key));
            if row.attributes.len() == before {
                return Err(StoreError::NoSuchAttribute);
            }
            Ok(())
        }
        AttrChange::DeleteValues { name, values } => {
            let key = name.to_lowercase();
            let row = inner.row_mut(id)?;
            for value in values {
                let position = row
                    .attributes
                    .iter()
                    .position(|attr| attr.name.eq_ignore_ascii_case(&key) && attr.value == *value)
                    .ok_or(StoreError::NoSuchAttribute)?;
                row.attributes.remove(position);
            }
            Ok(())
        }
        AttrChange::Replace { name, values } => {
            let key = name.to_lowercase();
            if let Some(column) = UserColumn::from_attr(&key) {
                let value = values.first().and_then(|v| v.as_text());
                return inner.set_user_column(id, column, value);
            }
            if DirColumn::from_attr(&key) == Some(DirColumn::ObjectClass) {
                if let Some(value) = values.first().and_then(|v| v.as_text()) {
                    inner.row_mut(id)?.entry.object_class = value.to_string();
                }
            }
            let row = inner.row_mut(id)?;
            row.attributes
                .retain(|attr| !attr.name.eq_ignore_ascii_case(&key));
            for value in values {
                row.attributes.push(StoredAttribute {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            Ok(())
        }
        AttrChange::AddGroups { groups } => {
            for &group_dir in groups {
                inner.add_membership(group_dir, id)?;
            }
            Ok(())
        }
        AttrChange::RemoveGroups { groups } => {
            match groups {
                None => inner.remove_memberships_of(id),
                Some(groups) => {
                    for group_dir in groups {
                        if let Some(group) = inner.groups.get_mut(group_dir) {
                            group.members.remove(&id);
                        }
                    }
                }
            }
            Ok(())
        }
        AttrChange::SetPassword { hash } => {
            let uid = *inner
                .users_by_dir
                .get(&id)
                .ok_or_else(|| StoreError::Constraint("entry has no user account".to_string()))?;
            let user = inner.users.get_mut(&uid).ok_or(StoreError::NoSuchEntry)?;
            let previous = std::mem::replace(&mut user.password_hash, hash.clone());
            user.password_history.push(previous);

            // lift a pending force-reset and stamp the change time
            let stamp = crate::policy::pwd_last_set_now(Utc::now());
            let row = inner.row_mut(id)?;
            let mut stamped = false;
            for attr in row.attributes.iter_mut() {
                if attr.name.eq_ignore_ascii_case("pwdlastset") {
                    attr.value = AttrValue::Text(stamp.clone());
                    stamped = true;
                }
            }
            if !stamped {
                row.attributes.push(StoredAttribute {
                    name: "pwdLastSet".to_string(),
                    value: AttrValue::Text(stamp),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirectoryStore;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new("dc=md,dc=test");
        let root = ROOT_ID;
        let users_ou = store
            .add_entry(NewEntry {
                parent: root,
                name: "ou=users".to_string(),
                object_class: "organizationalUnit".to_string(),
                attributes: vec![StoredAttribute {
                    name: "objectClass".to_string(),
                    value: AttrValue::Text("organizationalUnit".to_string()),
                }],
                member_of: Vec::new(),
                user: None,
            })
            .await
            .expect("add ou");
        store
            .add_entry(NewEntry {
                parent: users_ou.id,
                name: "cn=user0".to_string(),
                object_class: "user".to_string(),
                attributes: vec![StoredAttribute {
                    name: "objectClass".to_string(),
                    value: AttrValue::Text("user".to_string()),
                }],
                member_of: Vec::new(),
                user: Some(NewUser {
                    sam_account_name: "user0".to_string(),
                    user_principal_name: "user0@md.test".to_string(),
                    display_name: "User 0".to_string(),
                    mail: "user0@md.test".to_string(),
                    password_hash: String::new(),
                }),
            })
            .await
            .expect("add user");
        store
    }

    #[tokio::test]
    async fn path_shape_invariant() {
        let store = seeded().await;
        let path = vec!["ou=users".to_string(), "cn=user0".to_string()];
        let entry = store.find_by_path(&path).await.unwrap().expect("entry");
        assert_eq!(entry.path.len() as u32, entry.depth);
        assert_eq!(entry.path.last().unwrap(), "cn=user0");
        assert_eq!(entry.name, "user0");
        assert_eq!(entry.dn("dc=md,dc=test"), "cn=user0,ou=users,dc=md,dc=test");
    }

    #[tokio::test]
    async fn sibling_collision_is_rejected() {
        let store = seeded().await;
        let parent = store
            .find_by_path(&["ou=users".to_string()])
            .await
            .unwrap()
            .unwrap();
        let dup = store
            .add_entry(NewEntry {
                parent: parent.id,
                name: "CN=User0".to_string(),
                object_class: "user".to_string(),
                attributes: Vec::new(),
                member_of: Vec::new(),
                user: None,
            })
            .await;
        assert_eq!(dup.unwrap_err(), StoreError::AlreadyExists);
    }

    #[tokio::test]
    async fn add_then_delete_restores_tree() {
        let store = seeded().await;
        let before: Vec<Vec<String>> = {
            let inner = store.inner.read().await;
            inner.entries.values().map(|r| r.entry.path.clone()).collect()
        };
        let added = store
            .add_entry(NewEntry {
                parent: ROOT_ID,
                name: "cn=temp".to_string(),
                object_class: "organization".to_string(),
                attributes: Vec::new(),
                member_of: Vec::new(),
                user: None,
            })
            .await
            .expect("add");
        store.delete_entry(added.id).await.expect("delete");
        let after: Vec<Vec<String>> = {
            let inner = store.inner.read().await;
            inner.entries.values().map(|r| r.entry.path.clone()).collect()
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn delete_refuses_non_leaf() {
        let store = seeded().await;
        let parent = store
            .find_by_path(&["ou=users".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.delete_entry(parent.id).await.unwrap_err(),
            StoreError::NotLeaf
        );
    }

    #[tokio::test]
    async fn group_cycle_is_refused() {
        let store = seeded().await;
        let make_group = |name: &str| NewEntry {
            parent: ROOT_ID,
            name: format!("cn={name}"),
            object_class: "group".to_string(),
            attributes: Vec::new(),
            member_of: Vec::new(),
            user: None,
        };
        let a = store.add_entry(make_group("a")).await.unwrap();
        let b = store.add_entry(make_group("b")).await.unwrap();
        // b member of a
        store
            .apply_changes(b.id, vec![AttrChange::AddGroups { groups: vec![a.id] }])
            .await
            .expect("b into a");
        // a member of b would close the loop
        let cycle = store
            .apply_changes(a.id, vec![AttrChange::AddGroups { groups: vec![b.id] }])
            .await;
        assert_eq!(cycle.unwrap_err(), StoreError::MembershipCycle);
    }

    #[tokio::test]
    async fn failed_change_list_rolls_back() {
        let store = seeded().await;
        let entry = store
            .find_by_path(&["ou=users".to_string(), "cn=user0".to_string()])
            .await
            .unwrap()
            .unwrap();
        let result = store
            .apply_changes(
                entry.id,
                vec![
                    AttrChange::AddValues {
                        name: "description".to_string(),
                        values: vec![AttrValue::Text("first".to_string())],
                    },
                    AttrChange::DeleteAttribute {
                        name: "missing".to_string(),
                    },
                ],
            )
            .await;
        assert_eq!(result.unwrap_err(), StoreError::NoSuchAttribute);
        // the first change must not have leaked
        let attrs = store.entry_attributes(entry.id).await.unwrap();
        assert!(!attrs.iter().any(|a| a.name == "description"));
    }

    #[tokio::test]
    async fn rename_rewrites_descendant_paths() {
        let store = seeded().await;
        let ou = store
            .find_by_path(&["ou=users".to_string()])
            .await
            .unwrap()
            .unwrap();
        store
            .rename_entry(ou.id, "ou=people", true, None)
            .await
            .expect("rename");
        let moved = store
            .find_by_path(&["ou=people".to_string(), "cn=user0".to_string()])
            .await
            .unwrap();
        assert!(moved.is_some());
        let old = store
            .find_by_path(&["ou=users".to_string(), "cn=user0".to_string()])
            .await
            .unwrap();
        assert!(old.is_none());
        let moved = moved.unwrap();
        assert_eq!(moved.depth, 2);
        assert_eq!(moved.dn("dc=md,dc=test"), "cn=user0,ou=people,dc=md,dc=test");
    }
}
