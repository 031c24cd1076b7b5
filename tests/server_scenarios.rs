//! End-to-end protocol scenarios over a real TCP connection

mod common;

use common::{seeded_store, spawn_server, TestClient, BASE_DN};
use ldapd::filter::{
    Attribute, AttributeValue, AttributeValueAssertion, Filter, PartialAttribute, Substring,
    SubstringFilter,
};
use ldapd::ldap::{
    AddRequest, AuthenticationChoice, BindRequest, Change, DerefAliases, LdapDN, LdapString,
    ModifyRequest, Operation, ProtocolOp, ResultCode, SearchRequest, SearchScope,
};
use std::borrow::Cow;

fn bind_op(name: &str, password: &str) -> ProtocolOp<'static> {
    ProtocolOp::BindRequest(BindRequest {
        version: 3,
        name: LdapDN(Cow::Owned(name.to_string())),
        authentication: AuthenticationChoice::Simple(Cow::Owned(password.as_bytes().to_vec())),
    })
}

fn search_op(
    base: &str,
    scope: SearchScope,
    filter: Filter<'static>,
    attrs: &[&str],
) -> ProtocolOp<'static> {
    ProtocolOp::SearchRequest(SearchRequest {
        base_object: LdapDN(Cow::Owned(base.to_string())),
        scope,
        deref_aliases: DerefAliases::NeverDerefAliases,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter,
        attributes: attrs
            .iter()
            .map(|a| LdapString(Cow::Owned(a.to_string())))
            .collect(),
    })
}

fn eq_filter(attr: &str, value: &str) -> Filter<'static> {
    Filter::EqualityMatch(AttributeValueAssertion {
        attribute_desc: LdapString(Cow::Owned(attr.to_string())),
        assertion_value: Cow::Owned(value.as_bytes().to_vec()),
    })
}

fn attr_values(entry: &[PartialAttribute], name: &str) -> Vec<String> {
    entry
        .iter()
        .filter(|attr| attr.attr_type.0.eq_ignore_ascii_case(name))
        .flat_map(|attr| attr.attr_vals.iter())
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .collect()
}

async fn bound_client(addr: std::net::SocketAddr) -> TestClient {
    let mut client = TestClient::connect(addr).await;
    client
        .send(1, bind_op("cn=user0,ou=users,dc=md,dc=test", "password"))
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::BindResponse(r) => assert_eq!(r.result.result_code, ResultCode::Success),
        other => panic!("unexpected {other:?}"),
    }
    client
}

// (a) RootDSE query
#[tokio::test]
async fn root_dse_reports_naming_context_and_vendor() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(
            1,
            search_op(
                "",
                SearchScope::BaseObject,
                Filter::Present(LdapString(Cow::Borrowed("objectClass"))),
                &["namingContexts", "vendorName"],
            ),
        )
        .await;

    let entry = client.recv().await;
    match entry.protocol_op {
        ProtocolOp::SearchResultEntry(entry) => {
            assert_eq!(entry.object_name.0, "");
            assert_eq!(attr_values(&entry.attributes, "namingContexts"), [BASE_DN]);
            assert_eq!(
                attr_values(&entry.attributes, "vendorName"),
                ["MultiDirectory"]
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    let done = client.recv().await;
    match done.protocol_op {
        ProtocolOp::SearchResultDone(result) => {
            assert_eq!(result.result_code, ResultCode::Success)
        }
        other => panic!("unexpected {other:?}"),
    }
}

// (b) simple bind happy path
#[tokio::test]
async fn bind_succeeds_under_matching_policy() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = TestClient::connect(addr).await;
    client
        .send(7, bind_op("cn=user0,ou=users,dc=md,dc=test", "password"))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp.message_id.0, 7);
    match resp.protocol_op {
        ProtocolOp::BindResponse(r) => {
            assert_eq!(r.result.result_code, ResultCode::Success);
            assert_eq!(r.result.matched_dn.0, BASE_DN);
        }
        other => panic!("unexpected {other:?}"),
    }
}

// (c) bind policy reject
#[tokio::test]
async fn bind_fails_when_user_leaves_allowed_group() {
    let addr = spawn_server(seeded_store(false).await).await;
    let mut client = TestClient::connect(addr).await;
    client
        .send(7, bind_op("cn=user0,ou=users,dc=md,dc=test", "password"))
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::BindResponse(r) => {
            assert_eq!(r.result.result_code, ResultCode::InvalidCredentials)
        }
        other => panic!("unexpected {other:?}"),
    }
}

// wrong password must look identical to a policy reject
#[tokio::test]
async fn bind_fails_with_wrong_password() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = TestClient::connect(addr).await;
    client
        .send(2, bind_op("user0@md.test", "nope"))
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::BindResponse(r) => {
            assert_eq!(r.result.result_code, ResultCode::InvalidCredentials)
        }
        other => panic!("unexpected {other:?}"),
    }
}

// (d) add with memberOf, then search by membership
#[tokio::test]
async fn add_with_member_of_is_found_by_membership_filter() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;

    let attrs = vec![
        Attribute {
            attr_type: LdapString(Cow::Borrowed("objectClass")),
            attr_vals: vec![
                AttributeValue(Cow::Borrowed(b"organization")),
                AttributeValue(Cow::Borrowed(b"top")),
            ],
        },
        Attribute {
            attr_type: LdapString(Cow::Borrowed("memberOf")),
            attr_vals: vec![AttributeValue(Cow::Borrowed(
                b"cn=domain admins,cn=groups,dc=md,dc=test",
            ))],
        },
    ];
    client
        .send(
            2,
            ProtocolOp::AddRequest(AddRequest {
                entry: LdapDN(Cow::Borrowed("cn=test,dc=md,dc=test")),
                attributes: attrs,
            }),
        )
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::AddResponse(result) => assert_eq!(result.result_code, ResultCode::Success),
        other => panic!("unexpected {other:?}"),
    }

    client
        .send(
            3,
            search_op(
                BASE_DN,
                SearchScope::WholeSubtree,
                eq_filter("memberOf", "cn=domain admins,cn=groups,dc=md,dc=test"),
                &[],
            ),
        )
        .await;

    let mut dns = Vec::new();
    loop {
        let msg = client.recv().await;
        match msg.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => dns.push(entry.object_name.0.into_owned()),
            ProtocolOp::SearchResultDone(result) => {
                assert_eq!(result.result_code, ResultCode::Success);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(dns.contains(&"cn=test,dc=md,dc=test".to_string()), "{dns:?}");
}

// (e) modify replace password below the policy minimum
#[tokio::test]
async fn weak_password_is_rejected_with_policy_diagnostic() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;

    client
        .send(
            2,
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
                changes: vec![Change {
                    operation: Operation::Replace,
                    modification: PartialAttribute {
                        attr_type: LdapString(Cow::Borrowed("userPassword")),
                        attr_vals: vec![AttributeValue(Cow::Borrowed(b"Weak"))],
                    },
                }],
            }),
        )
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::ModifyResponse(r) => {
            assert_eq!(r.result.result_code, ResultCode::ConstraintViolation);
            assert!(
                r.result
                    .diagnostic_message
                    .0
                    .contains("password minimum length violation"),
                "{}",
                r.result.diagnostic_message.0
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

// (f) subtree search with a substring filter
#[tokio::test]
async fn subtree_substring_search_matches_users() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;

    client
        .send(
            2,
            search_op(
                BASE_DN,
                SearchScope::WholeSubtree,
                Filter::Substrings(SubstringFilter {
                    filter_type: LdapString(Cow::Borrowed("cn")),
                    substrings: vec![Substring::Initial(ldapd::filter::AssertionValue(
                        Cow::Borrowed(b"user"),
                    ))],
                }),
                &["cn"],
            ),
        )
        .await;

    let mut entries = 0usize;
    loop {
        let msg = client.recv().await;
        match msg.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => {
                assert!(
                    entry.object_name.0.starts_with("cn=user"),
                    "{}",
                    entry.object_name.0
                );
                entries += 1;
            }
            ProtocolOp::SearchResultDone(result) => {
                assert_eq!(result.result_code, ResultCode::Success);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(entries >= 1);
}

// two in-flight searches on one connection both complete, frames intact
#[tokio::test]
async fn concurrent_searches_share_one_connection() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;

    client
        .send(
            10,
            search_op(BASE_DN, SearchScope::WholeSubtree, eq_filter("cn", "user0"), &["cn"]),
        )
        .await;
    client
        .send(
            11,
            search_op(
                BASE_DN,
                SearchScope::WholeSubtree,
                eq_filter("objectClass", "group"),
                &["cn"],
            ),
        )
        .await;

    let mut done = std::collections::HashSet::new();
    while done.len() < 2 {
        let msg = client.recv().await;
        assert!(msg.message_id.0 == 10 || msg.message_id.0 == 11);
        if let ProtocolOp::SearchResultDone(result) = msg.protocol_op {
            assert_eq!(result.result_code, ResultCode::Success);
            assert!(done.insert(msg.message_id.0));
        }
    }
}

// anonymous peers see only the RootDSE
#[tokio::test]
async fn anonymous_search_is_denied_outside_root_dse() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = TestClient::connect(addr).await;
    client
        .send(
            3,
            search_op(BASE_DN, SearchScope::WholeSubtree, eq_filter("cn", "user0"), &[]),
        )
        .await;
    let resp = client.recv().await;
    match resp.protocol_op {
        ProtocolOp::SearchResultDone(result) => {
            assert_eq!(result.result_code, ResultCode::InsufficientAccessRights)
        }
        other => panic!("unexpected {other:?}"),
    }
}

// a broken frame gets a protocolError notice, then the connection closes
#[tokio::test]
async fn malformed_frame_closes_with_notice() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = TestClient::connect(addr).await;
    client.send_raw(&[0x42, 0x00]).await;
    let notice = client.recv_or_eof().await.expect("notice before close");
    match notice.protocol_op {
        ProtocolOp::ExtendedResponse(resp) => {
            assert_eq!(resp.result.result_code, ResultCode::ProtocolError)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.recv_or_eof().await.is_none());
}

// unbind closes the connection without a response
#[tokio::test]
async fn unbind_closes_the_connection() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;
    client.send(9, ProtocolOp::UnbindRequest).await;
    assert!(client.recv_or_eof().await.is_none());
}

// an abandoned message id simply stops producing; the connection survives
#[tokio::test]
async fn abandon_keeps_the_connection_usable() {
    let addr = spawn_server(seeded_store(true).await).await;
    let mut client = bound_client(addr).await;

    client
        .send(20, ProtocolOp::AbandonRequest(ldapd::ldap::MessageID(19)))
        .await;
    client
        .send(
            21,
            search_op(BASE_DN, SearchScope::WholeSubtree, eq_filter("cn", "user0"), &["cn"]),
        )
        .await;

    let mut saw_done = false;
    loop {
        let msg = client.recv().await;
        assert_eq!(msg.message_id.0, 21);
        if let ProtocolOp::SearchResultDone(result) = msg.protocol_op {
            assert_eq!(result.result_code, ResultCode::Success);
            saw_done = true;
            break;
        }
    }
    assert!(saw_done);
}
