use crate::error::*;
use crate::filter::*;
use crate::ldap::*;
use asn1_rs::nom;
use asn1_rs::OptTaggedImplicit;
use asn1_rs::{Any, Class, FromBer, ParseResult, Sequence, Set, Tag, TaggedParser};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, complete, map};
use nom::multi::{many0, many1};
use nom::sequence::delimited;
use nom::Err;
use std::borrow::Cow;

// AttributeDescription ::= LDAPString
//                         -- Constrained to <attributedescription>
//                         -- [RFC4512]
#[inline]
fn parse_ldap_attribute_description(i: &[u8]) -> Result<'_, LdapString<'_>> {
    LdapString::from_ber(i)
}

// AttributeValueAssertion ::= SEQUENCE {
//      attributeDesc   AttributeDescription,
//      assertionValue  AssertionValue }
fn parse_ldap_attribute_value_assertion_content(
    content: &[u8],
) -> Result<'_, AttributeValueAssertion<'_>> {
    let (content, attribute_desc) = parse_ldap_attribute_description(content)?;
    let (content, assertion_value) = parse_ldap_assertion_value(content)?;
    let assertion = AttributeValueAssertion {
        attribute_desc,
        assertion_value: assertion_value.into(),
    };
    Ok((content, assertion))
}

impl<'a> FromBer<'a, LdapError> for AttributeValueAssertion<'a> {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        Sequence::from_ber_and_then(bytes, parse_ldap_attribute_value_assertion_content)
    }
}

// AssertionValue ::= OCTET STRING
#[inline]
fn parse_ldap_assertion_value(i: &[u8]) -> Result<'_, &[u8]> {
    crate::parser::parse_ldap_octet_string_as_slice(i)
}

// AttributeValue ::= OCTET STRING
#[inline]
fn parse_ldap_attribute_value(i: &[u8]) -> Result<'_, AttributeValue<'_>> {
    map(crate::parser::parse_ldap_octet_string_as_slice, |v| {
        AttributeValue(Cow::Borrowed(v))
    })(i)
}

// PartialAttribute ::= SEQUENCE {
//      type       AttributeDescription,
//      vals       SET OF value AttributeValue }
impl<'a> FromBer<'a, LdapError> for PartialAttribute<'a> {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        Sequence::from_ber_and_then(bytes, |i| {
            let (i, attr_type) = LdapString::from_ber(i)?;
            let (i, attr_vals) = Set::from_ber_and_then(i, |inner| {
                many0(complete(parse_ldap_attribute_value))(inner)
            })?;
            let partial_attr = PartialAttribute {
                attr_type,
                attr_vals,
            };
            Ok((i, partial_attr))
        })
    }
}

// Attribute ::= PartialAttribute(WITH COMPONENTS {
//      ...,
//      vals (SIZE(1..MAX))})
impl<'a> FromBer<'a, LdapError> for Attribute<'a> {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        Sequence::from_ber_and_then(bytes, |i| {
            let (i, attr_type) = LdapString::from_ber(i)?;
            let (i, attr_vals) = Set::from_ber_and_then(i, |inner| {
                many1(complete(parse_ldap_attribute_value))(inner)
            })?;
            let attr = Attribute {
                attr_type,
                attr_vals,
            };
            Ok((i, attr))
        })
    }
}

// Filter ::= CHOICE {
//     and             [0] SET SIZE (1..MAX) OF filter Filter,
//     or              [1] SET SIZE (1..MAX) OF filter Filter,
//     not             [2] Filter,
//     equalityMatch   [3] AttributeValueAssertion,
//     substrings      [4] SubstringFilter,
//     greaterOrEqual  [5] AttributeValueAssertion,
//     lessOrEqual     [6] AttributeValueAssertion,
//     present         [7] AttributeDescription,
//     approxMatch     [8] AttributeValueAssertion,
//     extensibleMatch [9] MatchingRuleAssertion,
//     ...  }
impl<'a> FromBer<'a, LdapError> for Filter<'a> {
    fn from_ber(bytes: &'a [u8]) -> ParseResult<'a, Self, LdapError> {
        // read next element as ANY and look tag value
        let (rem, any) = Any::from_ber(bytes).map_err(Err::convert)?;
        // tag is context-specific IMPLICIT
        any.class()
            .assert_eq(Class::ContextSpecific)
            .map_err(|e| Err::Error(e.into()))?;
        let content = any.data;
        let (_, filter) = match any.tag().0 {
            0 => {
                let (rem, sub_filters) = many1(complete(Filter::from_ber))(content)?;
                Ok((rem, Filter::And(sub_filters)))
            }
            1 => {
                let (rem, sub_filters) = many1(complete(Filter::from_ber))(content)?;
                Ok((rem, Filter::Or(sub_filters)))
            }
            2 => map(Filter::from_ber, |f| Filter::Not(Box::new(f)))(content),
            3 => map(
                parse_ldap_attribute_value_assertion_content,
                Filter::EqualityMatch,
            )(content),
            4 => map(parse_ldap_substrings_filter_content, Filter::Substrings)(content),
            5 => map(
                parse_ldap_attribute_value_assertion_content,
                Filter::GreaterOrEqual,
            )(content),
            6 => map(
                parse_ldap_attribute_value_assertion_content,
                Filter::LessOrEqual,
            )(content),
            7 => {
                let s =
                    std::str::from_utf8(content).or(Err(Err::Error(LdapError::InvalidString)))?;
                let s = LdapString(Cow::Borrowed(s));
                Ok(([].as_ref(), Filter::Present(s)))
            }
            8 => map(
                parse_ldap_attribute_value_assertion_content,
                Filter::ApproxMatch,
            )(content),
            9 => map(
                parse_ldap_matching_rule_assertion_content,
                Filter::ExtensibleMatch,
            )(content),
            _ => Err(Err::Error(LdapError::InvalidFilterType)),
        }?;
        // use the remaining bytes from the outer object
        Ok((rem, filter))
    }
}

// SubstringFilter ::= SEQUENCE {
//      type           AttributeDescription,
//      substrings     SEQUENCE SIZE (1..MAX) OF substring CHOICE {
//           initial [0] AssertionValue,  -- can occur at most once
//           any     [1] AssertionValue,
//           final   [2] AssertionValue } -- can occur at most once
//      }
fn parse_ldap_substrings_filter_content(i: &[u8]) -> Result<'_, SubstringFilter<'_>> {
    let (i, filter_type) = parse_ldap_attribute_description(i)?;
    let (i, substrings) =
        Sequence::from_ber_and_then(i, |inner| many1(complete(parse_ldap_substring))(inner))?;
    let filter = SubstringFilter {
        filter_type,
        substrings,
    };
    Ok((i, filter))
}

fn parse_ldap_substring(bytes: &[u8]) -> Result<'_, Substring<'_>> {
    let (rem, any) = Any::from_ber(bytes).map_err(Err::convert)?;
    // in any case, this is an AssertionValue (== OCTET STRING)
    let b = AssertionValue(Cow::Borrowed(any.data));
    match any.tag().0 {
        0 => Ok((rem, Substring::Initial(b))),
        1 => Ok((rem, Substring::Any(b))),
        2 => Ok((rem, Substring::Final(b))),
        _ => Err(Err::Error(LdapError::InvalidSubstring)),
    }
}

// MatchingRuleAssertion ::= SEQUENCE {
//     matchingRule    [1] MatchingRuleId OPTIONAL,
//     type            [2] AttributeDescription OPTIONAL,
//     matchValue      [3] AssertionValue,
//     dnAttributes    [4] BOOLEAN DEFAULT FALSE }
fn parse_ldap_matching_rule_assertion_content(i: &[u8]) -> Result<'_, MatchingRuleAssertion<'_>> {
    // MatchingRuleId ::= LDAPString
    let (i, matching_rule) =
        asn1_rs::OptTaggedParser::new(Class::ContextSpecific, Tag(1)).parse_ber(i, |_, content| {
            let s = std::str::from_utf8(content).or(Err(Err::Error(LdapError::InvalidString)))?;
            let s = LdapString(Cow::Borrowed(s));
            Ok((&b""[..], s))
        })?;
    let (i, rule_type) =
        asn1_rs::OptTaggedParser::new(Class::ContextSpecific, Tag(2)).parse_ber(i, |_, content| {
            let s = std::str::from_utf8(content).or(Err(Err::Error(LdapError::InvalidString)))?;
            let s = AttributeDescription(Cow::Borrowed(s));
            Ok((&b""[..], s))
        })?;
    let (i, assertion_value) =
        TaggedParser::from_ber_and_then(Class::ContextSpecific, 3, i, |content| {
            let s = AssertionValue(Cow::Borrowed(content));
            Ok((&b""[..], s))
        })?;
    let (i, dn_attributes) =
        OptTaggedImplicit::<bool, asn1_rs::Error, 4>::from_ber(i).map_err(Err::convert)?;
    let dn_attributes = dn_attributes.map(|t| t.into_inner());
    let assertion = MatchingRuleAssertion {
        matching_rule,
        rule_type,
        assertion_value,
        dn_attributes,
    };
    Ok((i, assertion))
}

//
// ----------------------- RFC 4515 TEXT FORM -----------------------
//
// The HTTP side of the server carries filters as strings; the grammar below
// covers the subset the store query layer understands: and/or/not groups,
// equality/ordering/approx items, presence and '*' substrings. Escapes are
// not interpreted.

type StrResult<'a, T> = nom::IResult<&'a str, T, LdapError>;

/// Parse an RFC 4515 string filter, e.g. `(&(objectClass=user)(cn=user*))`
pub fn parse_ldap_filter_str(input: &str) -> std::result::Result<Filter<'_>, LdapError> {
    match all_consuming(parse_str_filter)(input) {
        Ok((_, filter)) => Ok(filter),
        Err(Err::Error(e)) | Err(Err::Failure(e)) => Err(e),
        Err(Err::Incomplete(_)) => Err(LdapError::InvalidFilterType),
    }
}

fn parse_str_filter(i: &str) -> StrResult<'_, Filter<'_>> {
    delimited(char('('), parse_str_filter_comp, char(')'))(i)
}

fn parse_str_filter_comp(i: &str) -> StrResult<'_, Filter<'_>> {
    alt((parse_str_and, parse_str_or, parse_str_not, parse_str_item))(i)
}

fn parse_str_and(i: &str) -> StrResult<'_, Filter<'_>> {
    let (i, _) = char('&')(i)?;
    map(many1(parse_str_filter), Filter::And)(i)
}

fn parse_str_or(i: &str) -> StrResult<'_, Filter<'_>> {
    let (i, _) = char('|')(i)?;
    map(many1(parse_str_filter), Filter::Or)(i)
}

fn parse_str_not(i: &str) -> StrResult<'_, Filter<'_>> {
    let (i, _) = char('!')(i)?;
    map(parse_str_filter, |f| Filter::Not(Box::new(f)))(i)
}

fn parse_str_item(i: &str) -> StrResult<'_, Filter<'_>> {
    let (i, attr) = take_while1(is_attr_char)(i)?;
    let (i, op) = alt((tag(">="), tag("<="), tag("~="), tag("=")))(i)?;
    let (i, value) = take_while(|c| c != ')' && c != '(')(i)?;
    let attr = LdapString(Cow::Borrowed(attr));
    let filter = match op {
        "=" if value == "*" => Filter::Present(attr),
        "=" if value.contains('*') => Filter::Substrings(str_substring_filter(attr, value)),
        "=" => Filter::EqualityMatch(str_ava(attr, value)),
        ">=" => Filter::GreaterOrEqual(str_ava(attr, value)),
        "<=" => Filter::LessOrEqual(str_ava(attr, value)),
        "~=" => Filter::ApproxMatch(str_ava(attr, value)),
        _ => unreachable!(),
    };
    Ok((i, filter))
}

fn is_attr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';'
}

fn str_ava<'a>(attribute_desc: LdapString<'a>, value: &'a str) -> AttributeValueAssertion<'a> {
    AttributeValueAssertion {
        attribute_desc,
        assertion_value: Cow::Borrowed(value.as_bytes()),
    }
}

fn str_substring_filter<'a>(filter_type: LdapString<'a>, value: &'a str) -> SubstringFilter<'a> {
    let parts: Vec<&str> = value.split('*').collect();
    let last = parts.len() - 1;
    let mut substrings = Vec::new();
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        let v = AssertionValue(Cow::Borrowed(part.as_bytes()));
        let sub = if idx == 0 {
            Substring::Initial(v)
        } else if idx == last {
            Substring::Final(v)
        } else {
            Substring::Any(v)
        };
        substrings.push(sub);
    }
    SubstringFilter {
        filter_type,
        substrings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_simple_equality() {
        let f = parse_ldap_filter_str("(objectClass=user)").expect("parse failed");
        match f {
            Filter::EqualityMatch(ava) => {
                assert_eq!(&ava.attribute_desc.0, "objectClass");
                assert_eq!(ava.assertion_value.as_ref(), b"user");
            }
            _ => panic!("wrong filter type"),
        }
    }

    #[test]
    fn parse_str_composite() {
        let f = parse_ldap_filter_str("(&(objectClass=user)(!(mail=*))(uid>=10))")
            .expect("parse failed");
        match f {
            Filter::And(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[1], Filter::Not(_)));
                assert!(matches!(items[2], Filter::GreaterOrEqual(_)));
            }
            _ => panic!("wrong filter type"),
        }
    }

    #[test]
    fn parse_str_substring_positions() {
        let f = parse_ldap_filter_str("(cn=*adm*in)").expect("parse failed");
        match f {
            Filter::Substrings(sub) => {
                assert_eq!(sub.substrings.len(), 2);
                assert!(matches!(sub.substrings[0], Substring::Any(_)));
                assert!(matches!(sub.substrings[1], Substring::Final(_)));
            }
            _ => panic!("wrong filter type"),
        }
    }

    #[test]
    fn parse_str_rejects_empty_group() {
        assert!(parse_ldap_filter_str("(&)").is_err());
        assert!(parse_ldap_filter_str("objectClass=user").is_err());
    }

    #[test]
    fn str_and_ber_forms_agree() {
        use asn1_rs::FromBer;
        // (cn=user0) in BER filter encoding: [3] { OCTET STRING "cn", OCTET STRING "user0" }
        let ber: &[u8] = &[
            0xa3, 0x0b, 0x04, 0x02, 0x63, 0x6e, 0x04, 0x05, 0x75, 0x73, 0x65, 0x72, 0x30,
        ];
        let (_, from_ber) = Filter::from_ber(ber).expect("ber parse failed");
        let from_str = parse_ldap_filter_str("(cn=user0)").expect("str parse failed");
        assert_eq!(from_ber, from_str);
    }
}
