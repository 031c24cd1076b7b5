//! DN handling
//!
//! Entries are addressed by materialised paths: ordered RDN components from
//! the naming-context root down to the entry, all lowercased. The `dc=`
//! components belong to the naming context and never appear in paths.

/// Lowercase a DN and strip the whitespace clients put after commas
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|part| part.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Check `attr=value` shape of every component
pub fn validate_dn(dn: &str) -> bool {
    if dn.is_empty() {
        return false;
    }
    dn.split(',').all(|part| {
        let part = part.trim();
        match part.split_once('=') {
            Some((attr, value)) => {
                !value.is_empty()
                    && !attr.is_empty()
                    && attr
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-')
            }
            None => false,
        }
    })
}

/// Root-first path of an entry relative to the naming context.
///
/// Returns `None` when the DN does not live under `base_dn`; the empty path
/// is the naming-context root itself.
pub fn dn_to_path(dn: &str, base_dn: &str) -> Option<Vec<String>> {
    let dn = normalize_dn(dn);
    let base = normalize_dn(base_dn);
    if dn == base {
        return Some(Vec::new());
    }
    let relative = dn.strip_suffix(&format!(",{base}"))?;
    let mut path: Vec<String> = relative.split(',').map(str::to_string).collect();
    path.reverse();
    Some(path)
}

/// Split a DN into its leading RDN and the parent DN
pub fn split_rdn(dn: &str) -> Option<(String, String)> {
    let dn = normalize_dn(dn);
    let (rdn, parent) = dn.split_once(',')?;
    Some((rdn.to_string(), parent.to_string()))
}

/// Realm spelled by the `dc=` components, e.g. `md.test` for `dc=md,dc=test`
pub fn base_dn_to_realm(base_dn: &str) -> String {
    normalize_dn(base_dn)
        .split(',')
        .filter_map(|part| part.strip_prefix("dc=").map(str::to_string))
        .collect::<Vec<_>>()
        .join(".")
}

/// Attribute and value of one RDN component
pub fn rdn_pair(rdn: &str) -> Option<(&str, &str)> {
    let (attr, value) = rdn.split_once('=')?;
    if attr.is_empty() || value.is_empty() {
        return None;
    }
    Some((attr, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_excludes_naming_context() {
        assert_eq!(
            dn_to_path("cn=user0,ou=users,dc=md,dc=test", "dc=md,dc=test"),
            Some(vec!["ou=users".to_string(), "cn=user0".to_string()])
        );
        assert_eq!(
            dn_to_path("dc=md,dc=test", "dc=md,dc=test"),
            Some(Vec::new())
        );
        assert_eq!(dn_to_path("cn=x,dc=other,dc=org", "dc=md,dc=test"), None);
    }

    #[test]
    fn normalization_is_case_and_space_insensitive() {
        assert_eq!(
            normalize_dn("CN=User0, OU=Users, DC=md, DC=test"),
            "cn=user0,ou=users,dc=md,dc=test"
        );
    }

    #[test]
    fn dn_validation() {
        assert!(validate_dn("cn=test,dc=md,dc=test"));
        assert!(!validate_dn("cn=,dc=md"));
        assert!(!validate_dn("not-a-dn"));
        assert!(!validate_dn(""));
    }

    #[test]
    fn rdn_splitting() {
        assert_eq!(
            split_rdn("cn=test,dc=md,dc=test"),
            Some(("cn=test".to_string(), "dc=md,dc=test".to_string()))
        );
        assert_eq!(rdn_pair("cn=test"), Some(("cn", "test")));
        assert_eq!(rdn_pair("cn="), None);
    }
}
