//! Per-connection session state
//!
//! `UNBOUND -> BINDING -> BOUND -> CLOSING` with an orthogonal TLS axis.
//! The active-operation set maps in-flight message ids to their cancel
//! tokens; Abandon and connection teardown act through it.

use crate::store::{NetworkPolicyRecord, UserRecord};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub enum BindState {
    #[default]
    Unbound,
    Binding,
    Bound {
        user: UserRecord,
        dn: String,
    },
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Plain,
    Negotiating,
    Established,
}

#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    state: Mutex<BindState>,
    tls: Mutex<TlsState>,
    policy: Mutex<Option<NetworkPolicyRecord>>,
    ops: Mutex<HashMap<u32, CancellationToken>>,
}

impl Session {
    pub fn new(peer: SocketAddr, tls: TlsState) -> Self {
        Session {
            peer,
            state: Mutex::new(BindState::Unbound),
            tls: Mutex::new(tls),
            policy: Mutex::new(None),
            ops: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn user(&self) -> Option<UserRecord> {
        match &*self.state.lock().await {
            BindState::Bound { user, .. } => Some(user.clone()),
            _ => None,
        }
    }

    pub async fn bound_dn(&self) -> Option<String> {
        match &*self.state.lock().await {
            BindState::Bound { dn, .. } => Some(dn.clone()),
            _ => None,
        }
    }

    pub async fn is_bound(&self) -> bool {
        matches!(&*self.state.lock().await, BindState::Bound { .. })
    }

    /// Snapshot the current state and enter BINDING; a failed Bind restores
    /// the snapshot, a successful one replaces it
    pub async fn begin_bind(&self) -> BindState {
        let mut state = self.state.lock().await;
        std::mem::replace(&mut *state, BindState::Binding)
    }

    pub async fn complete_bind(&self, user: UserRecord, dn: String) {
        *self.state.lock().await = BindState::Bound { user, dn };
    }

    pub async fn restore_state(&self, prior: BindState) {
        *self.state.lock().await = prior;
    }

    /// Unbind, or the UNBOUND leg of an anonymous rebind
    pub async fn reset_auth(&self) {
        *self.state.lock().await = BindState::Unbound;
        *self.policy.lock().await = None;
    }

    pub async fn begin_closing(&self) {
        *self.state.lock().await = BindState::Closing;
    }

    pub async fn tls_state(&self) -> TlsState {
        *self.tls.lock().await
    }

    pub async fn set_tls_state(&self, state: TlsState) {
        *self.tls.lock().await = state;
    }

    /// Network policy resolved at Bind, cached for the connection lifetime
    pub async fn cached_policy(&self) -> Option<NetworkPolicyRecord> {
        self.policy.lock().await.clone()
    }

    pub async fn cache_policy(&self, policy: NetworkPolicyRecord) {
        *self.policy.lock().await = Some(policy);
    }

    pub async fn register_op(&self, message_id: u32) -> CancellationToken {
        let token = CancellationToken::new();
        self.ops.lock().await.insert(message_id, token.clone());
        token
    }

    pub async fn finish_op(&self, message_id: u32) {
        self.ops.lock().await.remove(&message_id);
    }

    /// Abandon: best-effort cancellation of the identified operation
    pub async fn cancel_op(&self, message_id: u32) -> bool {
        match self.ops.lock().await.get(&message_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all_ops(&self) {
        for token in self.ops.lock().await.values() {
            token.cancel();
        }
    }

    pub async fn active_ops(&self) -> usize {
        self.ops.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:49152".parse().unwrap()
    }

    #[tokio::test]
    async fn failed_bind_restores_prior_state() {
        let session = Session::new(peer(), TlsState::Plain);
        let prior = session.begin_bind().await;
        assert!(matches!(prior, BindState::Unbound));
        session.restore_state(prior).await;
        assert!(!session.is_bound().await);
    }

    #[tokio::test]
    async fn abandon_cancels_registered_op() {
        let session = Session::new(peer(), TlsState::Plain);
        let token = session.register_op(7).await;
        assert!(session.cancel_op(7).await);
        assert!(token.is_cancelled());
        session.finish_op(7).await;
        assert!(!session.cancel_op(7).await);
    }
}
