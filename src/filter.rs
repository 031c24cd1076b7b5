//! Definition for types used in LDAP filters

use crate::ldap::LdapString;
use asn1_rs::ToStatic;
use std::borrow::Cow;
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub enum Filter<'a> {
    And(Vec<Filter<'a>>),
    Or(Vec<Filter<'a>>),
    Not(Box<Filter<'a>>),
    EqualityMatch(AttributeValueAssertion<'a>),
    Substrings(SubstringFilter<'a>),
    GreaterOrEqual(AttributeValueAssertion<'a>),
    LessOrEqual(AttributeValueAssertion<'a>),
    Present(LdapString<'a>),
    ApproxMatch(AttributeValueAssertion<'a>),
    ExtensibleMatch(MatchingRuleAssertion<'a>),
}

impl Filter<'_> {
    /// True for the `(objectClass=*)` presence filter, the RootDSE probe
    pub fn is_object_class_presence(&self) -> bool {
        match self {
            Filter::Present(attr) => attr.0.eq_ignore_ascii_case("objectClass"),
            _ => false,
        }
    }
}

/// Render the filter in RFC 4515 text form, for diagnostics
impl fmt::Display for Filter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_set(f: &mut fmt::Formatter<'_>, op: char, filters: &[Filter]) -> fmt::Result {
            write!(f, "({op}")?;
            for item in filters {
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }
        fn value(v: &[u8]) -> Cow<'_, str> {
            String::from_utf8_lossy(v)
        }
        match self {
            Filter::And(v) => write_set(f, '&', v),
            Filter::Or(v) => write_set(f, '|', v),
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::EqualityMatch(ava) => {
                write!(f, "({}={})", ava.attribute_desc.0, value(&ava.assertion_value))
            }
            Filter::GreaterOrEqual(ava) => {
                write!(f, "({}>={})", ava.attribute_desc.0, value(&ava.assertion_value))
            }
            Filter::LessOrEqual(ava) => {
                write!(f, "({}<={})", ava.attribute_desc.0, value(&ava.assertion_value))
            }
            Filter::ApproxMatch(ava) => {
                write!(f, "({}~={})", ava.attribute_desc.0, value(&ava.assertion_value))
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr.0),
            Filter::Substrings(sub) => {
                write!(f, "({}=", sub.filter_type.0)?;
                for (n, chunk) in sub.substrings.iter().enumerate() {
                    match chunk {
                        Substring::Initial(v) => write!(f, "{}*", value(&v.0))?,
                        Substring::Any(v) => {
                            if n == 0 {
                                write!(f, "*")?;
                            }
                            write!(f, "{}*", value(&v.0))?;
                        }
                        Substring::Final(v) => {
                            if n == 0 {
                                write!(f, "*")?;
                            }
                            write!(f, "{}", value(&v.0))?;
                        }
                    }
                }
                write!(f, ")")
            }
            Filter::ExtensibleMatch(m) => {
                write!(f, "(")?;
                if let Some(rule_type) = &m.rule_type {
                    write!(f, "{}", rule_type.0)?;
                }
                if let Some(rule) = &m.matching_rule {
                    write!(f, ":{}", rule.0)?;
                }
                write!(f, ":={})", value(&m.assertion_value.0))
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct PartialAttribute<'a> {
    pub attr_type: LdapString<'a>,
    pub attr_vals: Vec<AttributeValue<'a>>,
}

impl PartialAttribute<'static> {
    /// Build an owned attribute from string values (response construction)
    pub fn from_values(
        attr_type: impl Into<String>,
        values: impl IntoIterator<Item = String>,
    ) -> Self {
        PartialAttribute {
            attr_type: LdapString(Cow::Owned(attr_type.into())),
            attr_vals: values
                .into_iter()
                .map(|v| AttributeValue(Cow::Owned(v.into_bytes())))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct Attribute<'a> {
    pub attr_type: LdapString<'a>,
    pub attr_vals: Vec<AttributeValue<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct AttributeValueAssertion<'a> {
    pub attribute_desc: LdapString<'a>,
    pub assertion_value: Cow<'a, [u8]>,
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct AttributeDescription<'a>(pub Cow<'a, str>);

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct MatchingRuleAssertion<'a> {
    pub matching_rule: Option<LdapString<'a>>,
    pub rule_type: Option<AttributeDescription<'a>>,
    pub assertion_value: AssertionValue<'a>,
    pub dn_attributes: Option<bool>,
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct SubstringFilter<'a> {
    pub filter_type: LdapString<'a>,
    pub substrings: Vec<Substring<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub enum Substring<'a> {
    Initial(AssertionValue<'a>),
    Any(AssertionValue<'a>),
    Final(AssertionValue<'a>),
}

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct AssertionValue<'a>(pub Cow<'a, [u8]>);

#[derive(Clone, Debug, Eq, PartialEq, ToStatic)]
pub struct AttributeValue<'a>(pub Cow<'a, [u8]>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_rfc4515_text() {
        let f = Filter::And(vec![
            Filter::EqualityMatch(AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Borrowed("objectClass")),
                assertion_value: Cow::Borrowed(b"user"),
            }),
            Filter::Not(Box::new(Filter::Present(LdapString(Cow::Borrowed(
                "mail",
            ))))),
        ]);
        assert_eq!(f.to_string(), "(&(objectClass=user)(!(mail=*)))");
    }

    #[test]
    fn display_preserves_substring_positions() {
        let f = Filter::Substrings(SubstringFilter {
            filter_type: LdapString(Cow::Borrowed("cn")),
            substrings: vec![
                Substring::Initial(AssertionValue(Cow::Borrowed(b"user"))),
                Substring::Any(AssertionValue(Cow::Borrowed(b"0"))),
            ],
        });
        assert_eq!(f.to_string(), "(cn=user*0*)");
    }
}
