//! Access policy engines
//!
//! Network policies gate Bind by source address and group membership;
//! the password policy validates password changes.

use crate::store::{
    datetime_to_filetime, filetime_to_datetime, DirectoryEntry, NetworkPolicyRecord,
    PasswordPolicyRecord, UserRecord,
};
use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Passwords rejected outright by the complexity rule
const COMMON_PASSWORDS: &[&str] = &[
    "password", "123456", "12345678", "qwerty", "letmein", "admin", "welcome", "iloveyou",
    "monkey", "dragon", "master", "sunshine", "princess", "football",
];

/// First enabled policy whose network contains the peer, in ascending
/// priority order
pub fn resolve_network_policy(
    policies: &[NetworkPolicyRecord],
    peer: IpAddr,
) -> Option<NetworkPolicyRecord> {
    let mut candidates: Vec<&NetworkPolicyRecord> =
        policies.iter().filter(|p| p.enabled).collect();
    candidates.sort_by_key(|p| p.priority);
    candidates
        .into_iter()
        .find(|p| p.network.contains(&peer))
        .cloned()
}

/// True when the policy group allow-list admits one of the user's groups.
/// An empty allow-list admits any authenticated user.
pub fn policy_admits_groups(policy: &NetworkPolicyRecord, groups: &[DirectoryEntry]) -> bool {
    if policy.groups.is_empty() {
        return true;
    }
    groups.iter().any(|group| {
        policy
            .groups
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&group.name))
    })
}

/// Validate a new password against the policy; returns the violation list
/// (diagnostic strings reported to the client verbatim)
pub fn validate_password(
    policy: &PasswordPolicyRecord,
    password: &str,
    user: &UserRecord,
    pwd_last_set: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut errors = Vec::new();

    let last_set = pwd_last_set
        .and_then(|v| v.parse::<u64>().ok())
        .and_then(filetime_to_datetime)
        .unwrap_or(now);
    let password_age_days = (now - last_set).num_days();

    let history_depth = policy.history_length as usize;
    if user
        .password_history
        .iter()
        .rev()
        .take(history_depth)
        .any(|old| crate::auth::verify_password(password, old))
    {
        errors.push("password history violation".to_string());
    }

    if policy.maximum_age_days != 0 && password_age_days > policy.maximum_age_days as i64 {
        errors.push("password maximum age violation".to_string());
    }

    if password_age_days < policy.minimum_age_days as i64 {
        errors.push("password minimum age violation".to_string());
    }

    if password.len() <= policy.minimum_length as usize {
        errors.push("password minimum length violation".to_string());
    }

    if policy.complexity_required {
        let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let is_common = COMMON_PASSWORDS.contains(&password.to_lowercase().as_str());
        if !(has_upper && has_lower && has_digit && !is_common) {
            errors.push("password complexity violation".to_string());
        }
    }

    errors
}

/// FILETIME value stamped into `pwdLastSet` after a successful change
pub fn pwd_last_set_now(now: DateTime<Utc>) -> String {
    datetime_to_filetime(now).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::IpNet;

    fn policy(id: i64, cidr: &str, priority: u32, enabled: bool) -> NetworkPolicyRecord {
        NetworkPolicyRecord {
            id,
            name: format!("policy-{id}"),
            network: cidr.parse::<IpNet>().unwrap(),
            enabled,
            priority,
            groups: Vec::new(),
            mfa_required: false,
        }
    }

    #[test]
    fn first_matching_priority_wins() {
        let policies = vec![
            policy(1, "10.0.0.0/8", 20, true),
            policy(2, "127.0.0.0/8", 10, true),
            policy(3, "127.0.0.1/32", 30, true),
        ];
        let found = resolve_network_policy(&policies, "127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(found.id, 2);
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let policies = vec![policy(1, "127.0.0.0/8", 1, false)];
        assert!(resolve_network_policy(&policies, "127.0.0.1".parse().unwrap()).is_none());
    }

    fn test_user() -> UserRecord {
        UserRecord {
            id: 1,
            directory_id: 1,
            sam_account_name: "user0".into(),
            user_principal_name: "user0@md.test".into(),
            display_name: "User 0".into(),
            mail: "user0@md.test".into(),
            password_hash: String::new(),
            last_logon: None,
            account_expires: None,
            password_history: Vec::new(),
        }
    }

    #[test]
    fn short_password_reports_minimum_length() {
        let errors = validate_password(
            &PasswordPolicyRecord::default(),
            "Weak",
            &test_user(),
            None,
            Utc::now(),
        );
        assert!(errors.iter().any(|e| e == "password minimum length violation"));
    }

    #[test]
    fn complexity_rejects_common_and_single_case() {
        let policy = PasswordPolicyRecord {
            minimum_length: 4,
            ..Default::default()
        };
        let errors = validate_password(&policy, "password1", &test_user(), None, Utc::now());
        assert!(errors.iter().any(|e| e == "password complexity violation"));

        let errors = validate_password(&policy, "G00d-enough", &test_user(), None, Utc::now());
        assert!(errors.is_empty());
    }

    #[test]
    fn history_violation_detected_by_verification() {
        let mut user = test_user();
        user.password_history
            .push(crate::auth::hash_password("Previous1").unwrap());
        let policy = PasswordPolicyRecord {
            minimum_length: 4,
            ..Default::default()
        };
        let errors = validate_password(&policy, "Previous1", &user, None, Utc::now());
        assert!(errors.iter().any(|e| e == "password history violation"));
    }
}
