//! TCP listener and per-connection request pipeline
//!
//! One reader loop, N worker tasks over a bounded FIFO and one writer task
//! per connection. The bounded queue is the back-pressure point: the reader
//! parks on `send` when the workers fall behind. The writer serialises
//! whole frames, so responses for different message ids may interleave but
//! frames never do.

use crate::codec::{InboundFrame, LdapCodec};
use crate::config::ServerConfig;
use crate::handlers::{dispatch, RequestContext, Responder};
use crate::ldap::{
    ExtendedResponse, LdapMessage, LdapResult, MessageID, ProtocolOp, ResultCode, STARTTLS_OID,
};
use crate::mfa::{MfaExchange, MultifactorApi};
use crate::session::{Session, TlsState};
use crate::store::DirectoryStore;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::either::Either;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notice of Disconnection (RFC 4511 §4.4.1), sent before closing on a
/// broken frame
const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Reader back-pressure threshold: parsed requests waiting for a worker
const REQUEST_QUEUE_HIGH_WATER: usize = 64;
const WRITE_QUEUE_DEPTH: usize = 64;

type LdapStream = Either<TcpStream, tokio_rustls::server::TlsStream<TcpStream>>;
type QueuedRequest = (MessageID, ProtocolOp<'static>, CancellationToken);

pub struct LdapServer {
    pub store: Arc<dyn DirectoryStore>,
    pub config: Arc<ServerConfig>,
    pub mfa_exchange: Arc<MfaExchange>,
    pub mfa_api: Option<Arc<MultifactorApi>>,
    pub tls_acceptor: Option<TlsAcceptor>,
    /// TLS from the first byte instead of plaintext+StartTLS
    pub ldaps: bool,
}

enum PhaseExit {
    Close,
    /// StartTLS accepted for this message id; handshake follows
    StartTls,
}

impl LdapServer {
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(socket, peer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let (stream, tls_state) = if self.ldaps {
            let Some(acceptor) = self.tls_acceptor.clone() else {
                warn!(%peer, "LDAPS requested but TLS is not configured");
                return;
            };
            match acceptor.accept(socket).await {
                Ok(tls) => (Either::Right(tls), TlsState::Established),
                Err(e) => {
                    warn!(%peer, error = %e, "TLS accept failed");
                    return;
                }
            }
        } else {
            (Either::Left(socket), TlsState::Plain)
        };

        info!(%peer, "connection accepted");
        let session = Arc::new(Session::new(peer, tls_state));
        let mut stream = stream;
        loop {
            let (returned, exit) = self.run_phase(stream, session.clone()).await;
            match exit {
                PhaseExit::Close => break,
                PhaseExit::StartTls => {
                    let Some(Either::Left(plain)) = returned else {
                        warn!(%peer, "StartTLS on a non-plain stream");
                        break;
                    };
                    let Some(acceptor) = self.tls_acceptor.clone() else {
                        warn!(%peer, "StartTLS accepted without an acceptor");
                        break;
                    };
                    session.set_tls_state(TlsState::Negotiating).await;
                    match acceptor.accept(plain).await {
                        Ok(tls) => {
                            info!(%peer, "TLS established");
                            session.set_tls_state(TlsState::Established).await;
                            stream = Either::Right(tls);
                        }
                        Err(e) => {
                            warn!(%peer, error = %e, "TLS handshake failed");
                            break;
                        }
                    }
                }
            }
        }
        session.begin_closing().await;
        info!(%peer, "connection closed");
    }

    /// Run the pipeline until close or a TLS upgrade point, then hand the
    /// reunited stream back
    async fn run_phase(
        &self,
        stream: LdapStream,
        session: Arc<Session>,
    ) -> (Option<LdapStream>, PhaseExit) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, LdapCodec);

        let (out_tx, mut out_rx) = mpsc::channel::<LdapMessage<'static>>(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, LdapCodec);
            let mut broken = false;
            while let Some(msg) = out_rx.recv().await {
                if broken {
                    continue;
                }
                if framed.send(msg).await.is_err() {
                    broken = true;
                }
            }
            let _ = framed.flush().await;
            (framed.into_inner(), broken)
        });

        let (req_tx, req_rx) = mpsc::channel::<QueuedRequest>(REQUEST_QUEUE_HIGH_WATER);
        let req_rx = Arc::new(Mutex::new(req_rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers_per_connection {
            let ctx = WorkerContext {
                store: self.store.clone(),
                config: self.config.clone(),
                mfa_exchange: self.mfa_exchange.clone(),
                mfa_api: self.mfa_api.clone(),
                session: session.clone(),
                queue: req_rx.clone(),
                out_tx: out_tx.clone(),
            };
            workers.spawn(ctx.run());
        }

        let (exit, starttls_id) = self.read_loop(&mut reader, &req_tx, &out_tx, &session).await;

        if matches!(exit, PhaseExit::Close) {
            session.cancel_all_ops().await;
        }
        // close the queue and let the workers drain what was accepted
        drop(req_tx);
        while workers.join_next().await.is_some() {}

        if let Some(message_id) = starttls_id {
            // the success response is the last plaintext frame
            let response = LdapMessage::response(
                message_id,
                ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::success(""),
                    response_name: None,
                    response_value: None,
                }),
            );
            let _ = out_tx.send(response).await;
        }

        drop(out_tx);
        let (write_half, broken) = match writer.await {
            Ok(parts) => parts,
            Err(_) => return (None, PhaseExit::Close),
        };
        let stream = reader.into_inner().unsplit(write_half);
        if broken {
            return (Some(stream), PhaseExit::Close);
        }
        (Some(stream), exit)
    }

    async fn read_loop(
        &self,
        reader: &mut FramedRead<ReadHalf<LdapStream>, LdapCodec>,
        req_tx: &mpsc::Sender<QueuedRequest>,
        out_tx: &mpsc::Sender<LdapMessage<'static>>,
        session: &Arc<Session>,
    ) -> (PhaseExit, Option<MessageID>) {
        loop {
            let frame = match self.config.read_idle {
                Some(idle) => match tokio::time::timeout(idle, reader.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        info!(peer = %session.peer(), "closing idle connection");
                        return (PhaseExit::Close, None);
                    }
                },
                None => reader.next().await,
            };

            let msg = match frame {
                None => return (PhaseExit::Close, None),
                Some(Err(e)) => {
                    warn!(peer = %session.peer(), error = %e, "read failed");
                    return (PhaseExit::Close, None);
                }
                Some(Ok(InboundFrame::Malformed(m))) => {
                    warn!(peer = %session.peer(), reason = %m.reason, "malformed frame");
                    let notice = LdapMessage::response(
                        MessageID(m.message_id),
                        ProtocolOp::ExtendedResponse(ExtendedResponse {
                            result: LdapResult::new(
                                ResultCode::ProtocolError,
                                "",
                                m.reason,
                            ),
                            response_name: Some(crate::ldap::LdapOID(
                                NOTICE_OF_DISCONNECTION_OID.into(),
                            )),
                            response_value: None,
                        }),
                    );
                    let _ = out_tx.send(notice).await;
                    return (PhaseExit::Close, None);
                }
                Some(Ok(InboundFrame::Message(msg))) => msg,
            };

            let message_id = msg.message_id;
            match msg.protocol_op {
                ProtocolOp::UnbindRequest => {
                    debug!(peer = %session.peer(), "unbind");
                    session.reset_auth().await;
                    return (PhaseExit::Close, None);
                }
                ProtocolOp::AbandonRequest(target) => {
                    // no response by definition
                    session.cancel_op(target.0).await;
                }
                ProtocolOp::ExtendedRequest(ref req) if req.request_name.0 == STARTTLS_OID => {
                    let available = self.tls_acceptor.is_some()
                        && session.tls_state().await == TlsState::Plain;
                    if available {
                        return (PhaseExit::StartTls, Some(message_id));
                    }
                    let refusal = LdapMessage::response(
                        message_id,
                        ProtocolOp::ExtendedResponse(ExtendedResponse {
                            result: LdapResult::new(
                                ResultCode::ProtocolError,
                                "",
                                "TLS is not available on this connection",
                            ),
                            response_name: None,
                            response_value: None,
                        }),
                    );
                    if out_tx.send(refusal).await.is_err() {
                        return (PhaseExit::Close, None);
                    }
                }
                op => {
                    let token = session.register_op(message_id.0).await;
                    // parks here when the queue is at the high-water mark
                    if req_tx.send((message_id, op, token)).await.is_err() {
                        return (PhaseExit::Close, None);
                    }
                }
            }
        }
    }
}

struct WorkerContext {
    store: Arc<dyn DirectoryStore>,
    config: Arc<ServerConfig>,
    mfa_exchange: Arc<MfaExchange>,
    mfa_api: Option<Arc<MultifactorApi>>,
    session: Arc<Session>,
    queue: Arc<Mutex<mpsc::Receiver<QueuedRequest>>>,
    out_tx: mpsc::Sender<LdapMessage<'static>>,
}

impl WorkerContext {
    async fn run(self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some((message_id, op, cancel)) = next else {
                return;
            };
            let ctx = RequestContext {
                store: self.store.clone(),
                session: self.session.clone(),
                config: self.config.clone(),
                mfa_exchange: self.mfa_exchange.clone(),
                mfa_api: self.mfa_api.clone(),
                cancel,
            };
            let responder = Responder::new(message_id, self.out_tx.clone());
            dispatch(&ctx, op, &responder).await;
            self.session.finish_op(message_id.0).await;
        }
    }
}
