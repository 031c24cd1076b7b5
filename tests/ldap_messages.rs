use ldapd::filter::{AttributeValueAssertion, Filter, Substring, SubstringFilter};
use ldapd::ldap::{
    AuthenticationChoice, BindRequest, DerefAliases, LdapDN, LdapMessage, LdapString, MessageID,
    ProtocolOp, SearchRequest, SearchScope,
};
use ldapd::FromBer;
use std::borrow::Cow;

fn message(message_id: u32, protocol_op: ProtocolOp<'static>) -> LdapMessage<'static> {
    LdapMessage {
        message_id: MessageID(message_id),
        protocol_op,
        controls: None,
    }
}

fn search_request(filter: Filter<'static>) -> ProtocolOp<'static> {
    ProtocolOp::SearchRequest(SearchRequest {
        base_object: LdapDN(Cow::Borrowed("dc=md,dc=test")),
        scope: SearchScope::WholeSubtree,
        deref_aliases: DerefAliases::NeverDerefAliases,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter,
        attributes: vec![LdapString(Cow::Borrowed("cn"))],
    })
}

#[test]
fn test_malformed_empty() {
    LdapMessage::from_ber(b"").expect_err("expected error");
}

#[test]
fn test_msg_roundtrip_search_request() {
    let msg = message(
        4,
        search_request(Filter::And(vec![
            Filter::EqualityMatch(AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Borrowed("objectClass")),
                assertion_value: Cow::Borrowed(b"user"),
            }),
            Filter::Substrings(SubstringFilter {
                filter_type: LdapString(Cow::Borrowed("cn")),
                substrings: vec![
                    Substring::Initial(ldapd::filter::AssertionValue(Cow::Borrowed(b"user"))),
                    Substring::Final(ldapd::filter::AssertionValue(Cow::Borrowed(b"0"))),
                ],
            }),
        ])),
    );
    let bytes = msg.to_bytes();
    let (rem, parsed) = LdapMessage::from_ber(&bytes).expect("parsing failed");
    assert!(rem.is_empty());
    assert_eq!(parsed, msg);
    // encoding the parsed form again is bit-exact
    assert_eq!(parsed.to_bytes(), bytes);
}

#[test]
fn test_msg_roundtrip_bind() {
    let msg = message(
        1,
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
            authentication: AuthenticationChoice::Simple(Cow::Borrowed(b"password")),
        }),
    );
    let bytes = msg.to_bytes();
    let (rem, parsed) = LdapMessage::from_ber(&bytes).expect("parsing failed");
    assert!(rem.is_empty());
    assert_eq!(parsed, msg);
}

#[test]
fn test_message_id_is_preserved() {
    for id in [1u32, 127, 128, 300, 70_000, 2_147_483_647] {
        let msg = message(id, ProtocolOp::UnbindRequest);
        let bytes = msg.to_bytes();
        let (_, parsed) = LdapMessage::from_ber(&bytes).expect("parsing failed");
        assert_eq!(parsed.message_id, MessageID(id));
    }
}

#[test]
fn test_filter_text_and_ber_forms_agree() {
    let text = "(&(objectClass=user)(|(cn=user*)(mail=*))(!(memberOf=cn=x,dc=md,dc=test)))";
    let from_text = ldapd::parse_ldap_filter_str(text).expect("text parse failed");

    // serialize through a search request and parse it back out
    let msg = message(9, search_request(to_static(&from_text)));
    let bytes = msg.to_bytes();
    let (_, parsed) = LdapMessage::from_ber(&bytes).expect("parsing failed");
    match parsed.protocol_op {
        ProtocolOp::SearchRequest(req) => assert_eq!(req.filter, from_text),
        _ => panic!("wrong protocol op"),
    }
}

fn to_static(filter: &Filter) -> Filter<'static> {
    use ldapd::ToStatic;
    filter.to_static()
}
