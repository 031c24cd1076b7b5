//! HTTP side channel for the multifactor flow
//!
//! Two endpoints: the provider callback (`POST /multifactor/create`) that
//! redispatches tokens into the per-UPN slots, and the interactive WS flow
//! (`/multifactor/connect`) speaking the JSON frame protocol:
//! `connected` -> credentials -> `pending` (redirect URL) -> `success`
//! (token), closing with 1013 on timeout, 1002 on protocol errors and 1007
//! on invalid payloads.

use crate::auth;
use crate::config::ServerConfig;
use crate::mfa::{
    MfaCreds, MfaExchange, MultifactorApi, SETTING_MFA_KEY, SETTING_MFA_SECRET,
};
use crate::store::{DirectoryStore, UserRecord};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Form, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const WS_PROTOCOL_ERROR: u16 = 1002;
const WS_INVALID_PAYLOAD: u16 = 1007;
const WS_TRY_AGAIN_LATER: u16 = 1013;

pub struct ApiState {
    pub store: Arc<dyn DirectoryStore>,
    pub config: Arc<ServerConfig>,
    pub mfa_exchange: Arc<MfaExchange>,
    pub mfa_api: Option<Arc<MultifactorApi>>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/multifactor/create", post(callback_mfa))
        .route("/multifactor/connect", any(connect_mfa))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CallbackForm {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Provider callback: validate the token and wake the waiting bind
async fn callback_mfa(
    State(state): State<Arc<ApiState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Json<Value>, StatusCode> {
    let creds = portal_credentials(state.store.as_ref())
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    let claims = crate::mfa::validate_token(&form.access_token, &creds)
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let uid: i64 = claims
        .uid
        .parse()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let user = state
        .store
        .user_by_id(uid)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let delivered = state
        .mfa_exchange
        .deliver(&user.user_principal_name, form.access_token)
        .await;
    if !delivered {
        return Err(StatusCode::REQUEST_TIMEOUT);
    }
    debug!(upn = %user.user_principal_name, "multifactor token delivered");
    Ok(Json(json!({ "success": true })))
}

async fn connect_mfa(
    State(state): State<Arc<ApiState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| two_factor_protocol(state, socket))
}

#[derive(Debug, Deserialize)]
struct Login {
    username: String,
    password: String,
}

async fn two_factor_protocol(state: Arc<ApiState>, mut socket: WebSocket) {
    let Some(api) = state.mfa_api.clone() else {
        close(&mut socket, WS_PROTOCOL_ERROR, "Missing API credentials").await;
        return;
    };
    let Some(creds) = portal_credentials(state.store.as_ref()).await else {
        close(&mut socket, WS_PROTOCOL_ERROR, "Missing API credentials").await;
        return;
    };

    if send_status(&mut socket, "connected", "").await.is_err() {
        return;
    }

    let login: Login = match receive_json(&mut socket).await {
        Ok(login) => login,
        Err(reason) => {
            close(&mut socket, WS_INVALID_PAYLOAD, reason).await;
            return;
        }
    };

    let Some(user) = authenticate(state.store.as_ref(), &login).await else {
        close(&mut socket, WS_PROTOCOL_ERROR, "Invalid credentials").await;
        return;
    };
    let upn = user.user_principal_name.clone();

    // bind-initiated challenges for the same account surface here as well
    let mut bind_urls = state.mfa_exchange.watch_urls(&upn).await;

    let url = match api
        .create_challenge(&creds, &upn, user.id, &state.config.mfa_callback_url)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            warn!(upn = %upn, error = %e, "multifactor challenge failed");
            state.mfa_exchange.unwatch_urls(&upn).await;
            close(&mut socket, WS_TRY_AGAIN_LATER, "Multifactor error").await;
            return;
        }
    };
    if send_status(&mut socket, "pending", &url).await.is_err() {
        state.mfa_exchange.unwatch_urls(&upn).await;
        return;
    }

    let mut token_rx = state.mfa_exchange.register(&upn).await;
    let deadline = tokio::time::sleep(state.config.mfa_timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            _ = &mut deadline => break Err("Two factor timeout"),
            token = &mut token_rx => match token {
                Ok(token) => break Ok(token),
                Err(_) => break Err("Two factor interrupted"),
            },
            url = bind_urls.recv() => {
                if let Some(url) = url {
                    if send_status(&mut socket, "pending", &url).await.is_err() {
                        break Err("Two factor interrupted");
                    }
                }
            }
        }
    };

    state.mfa_exchange.remove(&upn).await;
    state.mfa_exchange.unwatch_urls(&upn).await;

    match outcome {
        Ok(token) => {
            if send_status(&mut socket, "success", &token).await.is_ok() {
                let _ = socket.send(Message::Close(None)).await;
            }
        }
        Err(reason) => close(&mut socket, WS_TRY_AGAIN_LATER, reason).await,
    }
}

async fn authenticate(store: &dyn DirectoryStore, login: &Login) -> Option<UserRecord> {
    let user = match store.user_by_upn(&login.username).await.ok()? {
        Some(user) => user,
        None => store.user_by_sam(&login.username).await.ok()??,
    };
    auth::verify_password(&login.password, &user.password_hash).then_some(user)
}

async fn portal_credentials(store: &dyn DirectoryStore) -> Option<MfaCreds> {
    let key = store.get_setting(SETTING_MFA_KEY).await.ok()??;
    let secret = store.get_setting(SETTING_MFA_SECRET).await.ok()??;
    Some(MfaCreds { key, secret })
}

async fn send_status(socket: &mut WebSocket, status: &str, message: &str) -> Result<(), ()> {
    let frame = json!({ "status": status, "message": message }).to_string();
    socket
        .send(Message::Text(frame.into()))
        .await
        .map_err(|_| ())
}

async fn receive_json<T: serde::de::DeserializeOwned>(
    socket: &mut WebSocket,
) -> Result<T, &'static str> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).map_err(|_| "Invalid data");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) | None => return Err("Invalid data"),
            Some(Err(_)) => return Err("Invalid data"),
        }
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
