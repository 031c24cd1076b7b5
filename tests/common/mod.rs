//! Shared fixture: a seeded in-memory directory and a raw LDAP test client

use futures::StreamExt;
use ldapd::auth;
use ldapd::codec::{InboundFrame, LdapCodec};
use ldapd::config::ServerConfig;
use ldapd::ldap::{LdapMessage, MessageID, ProtocolOp};
use ldapd::mfa::MfaExchange;
use ldapd::serve::LdapServer;
use ldapd::store::{
    AttrValue, DirectoryStore, MemoryStore, NetworkPolicyRecord, NewEntry, NewUser,
    StoredAttribute,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

pub const BASE_DN: &str = "dc=md,dc=test";

pub fn server_config() -> ServerConfig {
    ServerConfig {
        vendor_name: "MultiDirectory".to_string(),
        vendor_version: "0.1.0".to_string(),
        allow_anonymous_bind: false,
        approx_as_inequality: true,
        group_depth_limit: 16,
        mfa_timeout: Duration::from_secs(5),
        mfa_callback_url: "http://127.0.0.1:8000/multifactor/create".to_string(),
        workers_per_connection: 3,
        read_idle: None,
    }
}

fn text_attr(name: &str, value: &str) -> StoredAttribute {
    StoredAttribute {
        name: name.to_string(),
        value: AttrValue::Text(value.to_string()),
    }
}

/// `dc=md,dc=test` with `ou=users/cn=user0`, `cn=groups/cn=domain admins`
/// and a localhost policy allowing `domain admins`
pub async fn seeded_store(user_in_admins: bool) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(BASE_DN));
    let root = store.find_by_path(&[]).await.unwrap().unwrap();

    let groups_cn = store
        .add_entry(NewEntry {
            parent: root.id,
            name: "cn=groups".to_string(),
            object_class: "container".to_string(),
            attributes: vec![text_attr("objectClass", "container")],
            member_of: Vec::new(),
            user: None,
        })
        .await
        .expect("add cn=groups");
    let admins = store
        .add_entry(NewEntry {
            parent: groups_cn.id,
            name: "cn=domain admins".to_string(),
            object_class: "group".to_string(),
            attributes: vec![
                text_attr("objectClass", "group"),
                text_attr("objectClass", "top"),
            ],
            member_of: Vec::new(),
            user: None,
        })
        .await
        .expect("add domain admins");

    let users_ou = store
        .add_entry(NewEntry {
            parent: root.id,
            name: "ou=users".to_string(),
            object_class: "organizationalUnit".to_string(),
            attributes: vec![text_attr("objectClass", "organizationalUnit")],
            member_of: Vec::new(),
            user: None,
        })
        .await
        .expect("add ou=users");
    store
        .add_entry(NewEntry {
            parent: users_ou.id,
            name: "cn=user0".to_string(),
            object_class: "user".to_string(),
            attributes: vec![
                text_attr("objectClass", "user"),
                text_attr("objectClass", "top"),
            ],
            member_of: if user_in_admins {
                vec![admins.id]
            } else {
                Vec::new()
            },
            user: Some(NewUser {
                sam_account_name: "user0".to_string(),
                user_principal_name: "user0@md.test".to_string(),
                display_name: "User 0".to_string(),
                mail: "user0@md.test".to_string(),
                password_hash: auth::hash_password("password").expect("hash"),
            }),
        })
        .await
        .expect("add user0");

    store
        .set_network_policies(vec![NetworkPolicyRecord {
            id: 1,
            name: "localhost".to_string(),
            network: "127.0.0.0/8".parse().expect("cidr"),
            enabled: true,
            priority: 1,
            groups: vec!["domain admins".to_string()],
            mfa_required: false,
        }])
        .await;

    store
}

pub async fn spawn_server(store: Arc<MemoryStore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = Arc::new(LdapServer {
        store,
        config: Arc::new(server_config()),
        mfa_exchange: Arc::new(MfaExchange::new()),
        mfa_api: None,
        tls_acceptor: None,
        ldaps: false,
    });
    tokio::spawn(server.serve(listener));
    addr
}

/// Raw protocol client: frames go out through the crate encoder, responses
/// come back through the same codec the server reads with
pub struct TestClient {
    reader: FramedRead<tokio::io::ReadHalf<TcpStream>, LdapCodec>,
    writer: WriteHalf<TcpStream>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = tokio::io::split(stream);
        TestClient {
            reader: FramedRead::new(read_half, LdapCodec),
            writer,
        }
    }

    pub async fn send(&mut self, message_id: u32, op: ProtocolOp<'static>) {
        let msg = LdapMessage {
            message_id: MessageID(message_id),
            protocol_op: op,
            controls: None,
        };
        self.writer
            .write_all(&msg.to_bytes())
            .await
            .expect("write frame");
        self.writer.flush().await.expect("flush");
    }

    /// Send raw octets, bypassing the encoder
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write raw");
        self.writer.flush().await.expect("flush");
    }

    pub async fn recv(&mut self) -> LdapMessage<'static> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("response timed out")
            .expect("connection closed")
            .expect("read error");
        match frame {
            InboundFrame::Message(msg) => msg,
            InboundFrame::Malformed(m) => panic!("malformed response frame: {}", m.reason),
        }
    }

    /// None when the server closed the connection
    pub async fn recv_or_eof(&mut self) -> Option<LdapMessage<'static>> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("response timed out")?;
        match frame.expect("read error") {
            InboundFrame::Message(msg) => Some(msg),
            InboundFrame::Malformed(m) => panic!("malformed response frame: {}", m.reason),
        }
    }
}
