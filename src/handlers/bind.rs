//! Bind handler: credential check, network policy, MFA second factor

use super::{HandlerError, RequestContext, Responder};
use crate::auth;
use crate::dn::dn_to_path;
use crate::error::OperationError;
use crate::ldap::{
    AuthenticationChoice, BindRequest, BindResponse, LdapResult, ProtocolOp, ResultCode,
};
use crate::mfa::{
    MfaCreds, SETTING_MFA_KEY, SETTING_MFA_KEY_LDAP, SETTING_MFA_SECRET, SETTING_MFA_SECRET_LDAP,
};
use crate::store::{DirectoryStore, NetworkPolicyRecord, UserRecord};
use chrono::Utc;
use tracing::{debug, info};

/// Uniform failure diagnostic: the peer never learns whether the name, the
/// password or the policy was at fault
const INVALID_CREDENTIALS: &str = "invalid username or password";

pub(super) async fn handle(
    ctx: &RequestContext,
    req: BindRequest<'static>,
    out: &Responder,
) -> Result<(), HandlerError> {
    if req.version != 3 {
        return Err(OperationError::protocol_error("only LDAPv3 is supported").into());
    }

    let name = req.name.0.trim().to_string();
    let password = match &req.authentication {
        AuthenticationChoice::Simple(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        AuthenticationChoice::Sasl(sasl) => {
            if !sasl.mechanism.0.eq_ignore_ascii_case("PLAIN") {
                return Err(OperationError::new(
                    ResultCode::AuthMethodNotSupported,
                    format!("SASL mechanism {} is not supported", sasl.mechanism.0),
                )
                .into());
            }
            let credentials = sasl.credentials.as_deref().unwrap_or(b"");
            match auth::parse_sasl_plain(credentials) {
                Some((_authcid, password)) => password,
                None => {
                    return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS).into())
                }
            }
        }
    };

    let anonymous = name.is_empty() && password.is_empty();

    if ctx.session.is_bound().await {
        if anonymous {
            // anonymous rebind transitions through UNBOUND
            ctx.session.reset_auth().await;
        } else {
            return Err(OperationError::new(
                ResultCode::StrongerAuthRequired,
                "session is already bound",
            )
            .into());
        }
    }

    if anonymous {
        if !ctx.config.allow_anonymous_bind {
            return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS).into());
        }
        out.send(ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::success(""),
            server_sasl_creds: None,
        }))
        .await?;
        return Ok(());
    }

    let base_dn = ctx.store.base_dn().await.map_err(OperationError::from)?;
    let prior = ctx.session.begin_bind().await;

    match authenticate(ctx, &name, &password, &base_dn).await {
        Ok(user) => {
            let _ = ctx.store.record_logon(user.id, Utc::now()).await;
            info!(upn = %user.user_principal_name, peer = %ctx.session.peer(), "bind succeeded");
            ctx.session.complete_bind(user, base_dn.clone()).await;
            out.send(ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(base_dn),
                server_sasl_creds: None,
            }))
            .await?;
            Ok(())
        }
        Err(err) => {
            ctx.session.restore_state(prior).await;
            debug!(name = %name, peer = %ctx.session.peer(), reason = %err.message, "bind rejected");
            Err(err.with_matched_dn(base_dn).into())
        }
    }
}

async fn authenticate(
    ctx: &RequestContext,
    name: &str,
    password: &str,
    base_dn: &str,
) -> Result<UserRecord, OperationError> {
    let user = resolve_user(ctx.store.as_ref(), name, base_dn)
        .await?
        .ok_or_else(|| OperationError::invalid_credentials(INVALID_CREDENTIALS))?;

    if !auth::verify_password(password, &user.password_hash) {
        return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS));
    }

    // a pending force-reset blocks authentication
    let attributes = ctx.store.entry_attributes(user.directory_id).await?;
    let force_reset = attributes.iter().any(|attr| {
        attr.name.eq_ignore_ascii_case("pwdLastSet") && attr.value.as_text() == Some("0")
    });
    if force_reset {
        return Err(OperationError::invalid_credentials(
            "password must be changed before binding",
        ));
    }

    if let Some(expires) = user.account_expires {
        if expires <= Utc::now() {
            return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS));
        }
    }

    let policies = ctx.store.network_policies().await?;
    let policy = crate::policy::resolve_network_policy(&policies, ctx.session.peer().ip())
        .ok_or_else(|| OperationError::invalid_credentials(INVALID_CREDENTIALS))?;

    if !policy.groups.is_empty() {
        let groups = ctx
            .store
            .user_groups(user.directory_id, ctx.config.group_depth_limit)
            .await?;
        if !crate::policy::policy_admits_groups(&policy, &groups) {
            return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS));
        }
    }

    if policy.mfa_required {
        second_factor(ctx, &user, &policy).await?;
    }

    ctx.session.cache_policy(policy).await;
    Ok(user)
}

/// Resolve the bind name: userPrincipalName, then sAMAccountName, then DN
async fn resolve_user(
    store: &dyn DirectoryStore,
    name: &str,
    base_dn: &str,
) -> Result<Option<UserRecord>, OperationError> {
    if let Some(user) = store.user_by_upn(name).await? {
        return Ok(Some(user));
    }
    if let Some(user) = store.user_by_sam(name).await? {
        return Ok(Some(user));
    }
    if let Some(path) = dn_to_path(name, base_dn) {
        if let Some(entry) = store.find_by_path(&path).await? {
            return Ok(store.user_by_directory(entry.id).await?);
        }
    }
    Ok(None)
}

/// Open an MFA challenge and park the bind on the per-UPN slot until the
/// callback delivers a token or the wait times out
async fn second_factor(
    ctx: &RequestContext,
    user: &UserRecord,
    policy: &NetworkPolicyRecord,
) -> Result<(), OperationError> {
    debug!(policy = %policy.name, upn = %user.user_principal_name, "policy requires a second factor");
    let api = ctx
        .mfa_api
        .as_ref()
        .ok_or_else(|| OperationError::invalid_credentials(INVALID_CREDENTIALS))?;
    let creds = mfa_credentials(ctx.store.as_ref())
        .await?
        .ok_or_else(|| OperationError::invalid_credentials(INVALID_CREDENTIALS))?;

    let upn = user.user_principal_name.clone();
    let url = api
        .create_challenge(&creds, &upn, user.id, &ctx.config.mfa_callback_url)
        .await
        .map_err(|e| OperationError::invalid_credentials(e.to_string()))?;

    let receiver = ctx.mfa_exchange.register(&upn).await;
    ctx.mfa_exchange.push_url(&upn, url).await;

    let waited = tokio::time::timeout(ctx.config.mfa_timeout, receiver).await;
    // the slot is removed on every exit path
    ctx.mfa_exchange.remove(&upn).await;

    let token = match waited {
        Ok(Ok(token)) => token,
        Ok(Err(_)) => {
            // overwritten by a newer wait for the same UPN
            return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS));
        }
        Err(_) => {
            return Err(OperationError::invalid_credentials(
                "second factor confirmation timed out",
            ));
        }
    };

    let claims = crate::mfa::validate_token(&token, &creds)
        .map_err(|e| OperationError::invalid_credentials(e.to_string()))?;
    if claims.uid != user.id.to_string() {
        return Err(OperationError::invalid_credentials(INVALID_CREDENTIALS));
    }
    Ok(())
}

/// LDAP-scope credential pair, falling back to the portal pair
async fn mfa_credentials(store: &dyn DirectoryStore) -> Result<Option<MfaCreds>, OperationError> {
    let ldap_key = store.get_setting(SETTING_MFA_KEY_LDAP).await?;
    let ldap_secret = store.get_setting(SETTING_MFA_SECRET_LDAP).await?;
    if let (Some(key), Some(secret)) = (ldap_key, ldap_secret) {
        return Ok(Some(MfaCreds { key, secret }));
    }
    let key = store.get_setting(SETTING_MFA_KEY).await?;
    let secret = store.get_setting(SETTING_MFA_SECRET).await?;
    Ok(match (key, secret) {
        (Some(key), Some(secret)) => Some(MfaCreds { key, secret }),
        _ => None,
    })
}
