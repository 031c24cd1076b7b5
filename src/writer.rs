//! LDAP message serialization
//!
//! Mirror of `parser`: every protocol op that can be parsed can be written
//! back out, and `LdapMessage::to_bytes` is the inverse of
//! `LdapMessage::from_ber` for well-formed values.

use crate::ber::{int_content, BerWriter};
use crate::filter::*;
use crate::ldap::*;
use bytes::Bytes;

impl LdapMessage<'_> {
    /// Serialize the message to one BER frame
    pub fn to_bytes(&self) -> Bytes {
        let mut w = BerWriter::new();
        w.sequence(|w| {
            w.integer(i64::from(self.message_id.0));
            write_protocol_op(w, &self.protocol_op);
            if let Some(controls) = &self.controls {
                w.context_constructed(0, |w| {
                    for control in controls {
                        write_control(w, control);
                    }
                });
            }
        });
        w.into_bytes()
    }
}

fn write_protocol_op(w: &mut BerWriter, op: &ProtocolOp) {
    let tag = op.tag().0 as u8;
    match op {
        ProtocolOp::BindRequest(req) => w.application_constructed(tag, |w| {
            w.integer(i64::from(req.version));
            w.octet_string(req.name.0.as_bytes());
            write_authentication_choice(w, &req.authentication);
        }),
        ProtocolOp::BindResponse(resp) => w.application_constructed(tag, |w| {
            write_result_content(w, &resp.result);
            if let Some(creds) = &resp.server_sasl_creds {
                w.context_primitive(7, creds);
            }
        }),
        ProtocolOp::UnbindRequest => w.application_primitive(tag, &[]),
        ProtocolOp::SearchRequest(req) => w.application_constructed(tag, |w| {
            w.octet_string(req.base_object.0.as_bytes());
            w.enumerated(req.scope.0);
            w.enumerated(req.deref_aliases.0);
            w.integer(i64::from(req.size_limit));
            w.integer(i64::from(req.time_limit));
            w.boolean(req.types_only);
            write_filter(w, &req.filter);
            w.sequence(|w| {
                for attr in &req.attributes {
                    w.octet_string(attr.0.as_bytes());
                }
            });
        }),
        ProtocolOp::SearchResultEntry(entry) => w.application_constructed(tag, |w| {
            w.octet_string(entry.object_name.0.as_bytes());
            w.sequence(|w| {
                for attr in &entry.attributes {
                    write_partial_attribute(w, attr);
                }
            });
        }),
        ProtocolOp::SearchResultDone(result)
        | ProtocolOp::AddResponse(result)
        | ProtocolOp::DelResponse(result)
        | ProtocolOp::ModDnResponse(result)
        | ProtocolOp::CompareResponse(result) => {
            w.application_constructed(tag, |w| write_result_content(w, result))
        }
        ProtocolOp::SearchResultReference(uris) => w.application_constructed(tag, |w| {
            for uri in uris {
                w.octet_string(uri.0.as_bytes());
            }
        }),
        ProtocolOp::ModifyRequest(req) => w.application_constructed(tag, |w| {
            w.octet_string(req.object.0.as_bytes());
            w.sequence(|w| {
                for change in &req.changes {
                    w.sequence(|w| {
                        w.enumerated(change.operation.0);
                        write_partial_attribute(w, &change.modification);
                    });
                }
            });
        }),
        ProtocolOp::ModifyResponse(resp) => {
            w.application_constructed(tag, |w| write_result_content(w, &resp.result))
        }
        ProtocolOp::AddRequest(req) => w.application_constructed(tag, |w| {
            w.octet_string(req.entry.0.as_bytes());
            w.sequence(|w| {
                for attr in &req.attributes {
                    write_attribute(w, attr);
                }
            });
        }),
        ProtocolOp::DelRequest(dn) => w.application_primitive(tag, dn.0.as_bytes()),
        ProtocolOp::ModDnRequest(req) => w.application_constructed(tag, |w| {
            w.octet_string(req.entry.0.as_bytes());
            w.octet_string(req.newrdn.0.as_bytes());
            w.boolean(req.deleteoldrdn);
            if let Some(superior) = &req.newsuperior {
                w.context_primitive(0, superior.0.as_bytes());
            }
        }),
        ProtocolOp::CompareRequest(req) => w.application_constructed(tag, |w| {
            w.octet_string(req.entry.0.as_bytes());
            w.sequence(|w| {
                w.octet_string(req.ava.attribute_desc.0.as_bytes());
                w.octet_string(&req.ava.assertion_value);
            });
        }),
        ProtocolOp::AbandonRequest(id) => {
            w.application_primitive(tag, &int_content(i64::from(id.0)))
        }
        ProtocolOp::ExtendedRequest(req) => w.application_constructed(tag, |w| {
            w.context_primitive(0, req.request_name.0.as_bytes());
            if let Some(value) = &req.request_value {
                w.context_primitive(1, value);
            }
        }),
        ProtocolOp::ExtendedResponse(resp) => w.application_constructed(tag, |w| {
            write_result_content(w, &resp.result);
            if let Some(name) = &resp.response_name {
                w.context_primitive(10, name.0.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                w.context_primitive(11, value);
            }
        }),
        ProtocolOp::IntermediateResponse(resp) => w.application_constructed(tag, |w| {
            if let Some(name) = &resp.response_name {
                w.context_primitive(0, name.0.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                w.context_primitive(1, value);
            }
        }),
    }
}

fn write_result_content(w: &mut BerWriter, result: &LdapResult) {
    w.enumerated(result.result_code.0);
    w.octet_string(result.matched_dn.0.as_bytes());
    w.octet_string(result.diagnostic_message.0.as_bytes());
}

fn write_authentication_choice(w: &mut BerWriter, auth: &AuthenticationChoice) {
    match auth {
        AuthenticationChoice::Simple(password) => w.context_primitive(0, password),
        AuthenticationChoice::Sasl(sasl) => w.context_constructed(3, |w| {
            w.octet_string(sasl.mechanism.0.as_bytes());
            if let Some(creds) = &sasl.credentials {
                w.octet_string(creds);
            }
        }),
    }
}

fn write_partial_attribute(w: &mut BerWriter, attr: &PartialAttribute) {
    w.sequence(|w| {
        w.octet_string(attr.attr_type.0.as_bytes());
        w.set(|w| {
            for value in &attr.attr_vals {
                w.octet_string(&value.0);
            }
        });
    });
}

fn write_attribute(w: &mut BerWriter, attr: &Attribute) {
    w.sequence(|w| {
        w.octet_string(attr.attr_type.0.as_bytes());
        w.set(|w| {
            for value in &attr.attr_vals {
                w.octet_string(&value.0);
            }
        });
    });
}

fn write_ava(w: &mut BerWriter, tag: u8, ava: &AttributeValueAssertion) {
    w.context_constructed(tag, |w| {
        w.octet_string(ava.attribute_desc.0.as_bytes());
        w.octet_string(&ava.assertion_value);
    });
}

fn write_filter(w: &mut BerWriter, filter: &Filter) {
    match filter {
        Filter::And(filters) => w.context_constructed(0, |w| {
            for f in filters {
                write_filter(w, f);
            }
        }),
        Filter::Or(filters) => w.context_constructed(1, |w| {
            for f in filters {
                write_filter(w, f);
            }
        }),
        Filter::Not(inner) => w.context_constructed(2, |w| write_filter(w, inner)),
        Filter::EqualityMatch(ava) => write_ava(w, 3, ava),
        Filter::Substrings(sub) => w.context_constructed(4, |w| {
            w.octet_string(sub.filter_type.0.as_bytes());
            w.sequence(|w| {
                for chunk in &sub.substrings {
                    match chunk {
                        Substring::Initial(v) => w.context_primitive(0, &v.0),
                        Substring::Any(v) => w.context_primitive(1, &v.0),
                        Substring::Final(v) => w.context_primitive(2, &v.0),
                    }
                }
            });
        }),
        Filter::GreaterOrEqual(ava) => write_ava(w, 5, ava),
        Filter::LessOrEqual(ava) => write_ava(w, 6, ava),
        Filter::Present(attr) => w.context_primitive(7, attr.0.as_bytes()),
        Filter::ApproxMatch(ava) => write_ava(w, 8, ava),
        Filter::ExtensibleMatch(assertion) => w.context_constructed(9, |w| {
            if let Some(rule) = &assertion.matching_rule {
                w.context_primitive(1, rule.0.as_bytes());
            }
            if let Some(rule_type) = &assertion.rule_type {
                w.context_primitive(2, rule_type.0.as_bytes());
            }
            w.context_primitive(3, &assertion.assertion_value.0);
            if let Some(dn_attributes) = assertion.dn_attributes {
                w.context_primitive(4, &[if dn_attributes { 0xff } else { 0x00 }]);
            }
        }),
    }
}

fn write_control(w: &mut BerWriter, control: &Control) {
    w.sequence(|w| {
        w.octet_string(control.control_type.0.as_bytes());
        if control.criticality {
            w.boolean(true);
        }
        if let Some(value) = &control.control_value {
            w.octet_string(value);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::{LdapResult, MessageID, ResultCode};
    use asn1_rs::FromBer;
    use hex_literal::hex;
    use std::borrow::Cow;

    fn roundtrip(msg: &LdapMessage) {
        let bytes = msg.to_bytes();
        let (rem, parsed) = LdapMessage::from_ber(&bytes).expect("reparse failed");
        assert!(rem.is_empty());
        assert_eq!(&parsed, msg);
    }

    #[test]
    fn roundtrip_bind_request() {
        roundtrip(&LdapMessage {
            message_id: MessageID(1),
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
                authentication: AuthenticationChoice::Simple(Cow::Borrowed(b"password")),
            }),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_bind_response() {
        roundtrip(&LdapMessage {
            message_id: MessageID(1),
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::new(ResultCode::Success, "dc=md,dc=test", ""),
                server_sasl_creds: None,
            }),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_search_request_with_filter() {
        roundtrip(&LdapMessage {
            message_id: MessageID(7),
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: LdapDN(Cow::Borrowed("dc=md,dc=test")),
                scope: SearchScope::WholeSubtree,
                deref_aliases: DerefAliases::NeverDerefAliases,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: Filter::And(vec![
                    Filter::EqualityMatch(AttributeValueAssertion {
                        attribute_desc: LdapString(Cow::Borrowed("objectClass")),
                        assertion_value: Cow::Borrowed(b"user"),
                    }),
                    Filter::Substrings(SubstringFilter {
                        filter_type: LdapString(Cow::Borrowed("cn")),
                        substrings: vec![
                            Substring::Initial(AssertionValue(Cow::Borrowed(b"user"))),
                            Substring::Any(AssertionValue(Cow::Borrowed(b"0"))),
                        ],
                    }),
                    Filter::Not(Box::new(Filter::Present(LdapString(Cow::Borrowed(
                        "memberOf",
                    ))))),
                ]),
                attributes: vec![
                    LdapString(Cow::Borrowed("cn")),
                    LdapString(Cow::Borrowed("mail")),
                ],
            }),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_search_result_entry() {
        roundtrip(&LdapMessage {
            message_id: MessageID(2),
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
                attributes: vec![PartialAttribute {
                    attr_type: LdapString(Cow::Borrowed("objectClass")),
                    attr_vals: vec![
                        AttributeValue(Cow::Borrowed(b"top")),
                        AttributeValue(Cow::Borrowed(b"user")),
                    ],
                }],
            }),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_modify_request() {
        roundtrip(&LdapMessage {
            message_id: MessageID(3),
            protocol_op: ProtocolOp::ModifyRequest(ModifyRequest {
                object: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
                changes: vec![Change {
                    operation: Operation::Replace,
                    modification: PartialAttribute {
                        attr_type: LdapString(Cow::Borrowed("userPassword")),
                        attr_vals: vec![AttributeValue(Cow::Borrowed(b"S3cret!pass"))],
                    },
                }],
            }),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_extended_and_abandon() {
        roundtrip(&LdapMessage {
            message_id: MessageID(4),
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: LdapOID(Cow::Borrowed(STARTTLS_OID)),
                request_value: None,
            }),
            controls: None,
        });
        roundtrip(&LdapMessage {
            message_id: MessageID(6),
            protocol_op: ProtocolOp::AbandonRequest(MessageID(5)),
            controls: None,
        });
    }

    #[test]
    fn roundtrip_moddn_and_delete() {
        roundtrip(&LdapMessage {
            message_id: MessageID(9),
            protocol_op: ProtocolOp::ModDnRequest(ModDnRequest {
                entry: LdapDN(Cow::Borrowed("cn=user0,ou=users,dc=md,dc=test")),
                newrdn: RelativeLdapDN(Cow::Borrowed("cn=user1")),
                deleteoldrdn: true,
                newsuperior: Some(LdapDN(Cow::Borrowed("ou=it,dc=md,dc=test"))),
            }),
            controls: None,
        });
        roundtrip(&LdapMessage {
            message_id: MessageID(10),
            protocol_op: ProtocolOp::DelRequest(LdapDN(Cow::Borrowed(
                "cn=user0,ou=users,dc=md,dc=test",
            ))),
            controls: None,
        });
    }

    #[test]
    fn abandon_wire_format_matches_fixture() {
        let msg = LdapMessage {
            message_id: MessageID(6),
            protocol_op: ProtocolOp::AbandonRequest(MessageID(5)),
            controls: None,
        };
        assert_eq!(
            msg.to_bytes().as_ref(),
            &hex!("30 06 02 01 06 50 01 05"),
        );
    }
}
