//! # ldapd
//!
//! A Lightweight Directory Access Protocol ([RFC4511]) directory server
//! core. The wire layer parses BER with the [nom](https://github.com/rust-bakery/nom)
//! combinators re-exported by `asn1-rs` and writes responses through its own
//! minimal-form encoder; operation handlers run against the pluggable
//! [`store::DirectoryStore`] contract, gated by network policies and an
//! optional multifactor second factor.
//!
//! Per connection, one reader task feeds a bounded queue drained by worker
//! tasks, and a single writer serialises whole response frames. StartTLS
//! swaps the transport mid-connection; LDAPS serves TLS from the first byte.
//!
//! [RFC4511]: https://www.rfc-editor.org/rfc/rfc4511

#![deny(unstable_features, unused_import_braces, unused_qualifications)]
#![warn(unreachable_pub)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod api;
pub mod auth;
pub mod ber;
pub mod codec;
pub mod config;
pub mod dn;
pub mod error;
pub mod filter;
mod filter_parser;
pub mod handlers;
pub mod ldap;
pub mod mfa;
pub mod parser;
pub mod policy;
pub mod query;
pub mod serve;
pub mod session;
pub mod store;
mod writer;

pub use crate::filter_parser::parse_ldap_filter_str;
pub use asn1_rs::{FromBer, ToStatic};
