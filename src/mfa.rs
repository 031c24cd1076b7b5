//! Multifactor second-factor integration
//!
//! The provider is an external HTTP API: Bind opens a challenge, the
//! provider redirects the user, and the callback endpoint (`api` module)
//! posts the issued token back. Waiting binds park on a per-UPN single-slot
//! map; a duplicate wait for the same UPN overwrites the prior slot.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Settings names for the portal credential pair
pub const SETTING_MFA_KEY: &str = "mfa_key";
pub const SETTING_MFA_SECRET: &str = "mfa_secret";
/// Settings names for the LDAP-scope credential pair
pub const SETTING_MFA_KEY_LDAP: &str = "mfa_key_ldap";
pub const SETTING_MFA_SECRET_LDAP: &str = "mfa_secret_ldap";

#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    #[error("MFA API error: {0}")]
    Api(String),
    #[error("invalid MFA token: {0}")]
    InvalidToken(String),
    #[error("MFA confirmation timed out")]
    Timeout,
}

/// API key is the token audience, the secret signs it
#[derive(Debug, Clone)]
pub struct MfaCreds {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct MfaClaims {
    pub uid: String,
}

/// Validate a callback token against the stored credentials
pub fn validate_token(token: &str, creds: &MfaCreds) -> Result<MfaClaims, MfaError> {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[creds.key.clone()]);
    decode::<MfaClaims>(
        token,
        &DecodingKey::from_secret(creds.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| MfaError::InvalidToken(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct MultifactorApi {
    client: reqwest::Client,
    base_uri: String,
}

impl MultifactorApi {
    const CREATE_URL: &'static str = "/requests";
    const CHECK_URL: &'static str = "/requests/ra";

    pub fn new(base_uri: impl Into<String>) -> Self {
        MultifactorApi {
            client: reqwest::Client::new(),
            base_uri: base_uri.into(),
        }
    }

    /// Open a challenge; returns the redirect URL the user must visit
    pub async fn create_challenge(
        &self,
        creds: &MfaCreds,
        identity: &str,
        uid: i64,
        callback_url: &str,
    ) -> Result<String, MfaError> {
        let payload = json!({
            "identity": identity,
            "claims": {
                "uid": uid.to_string(),
                "grant_type": "multifactor",
            },
            "callback": {
                "action": callback_url,
                "target": "_self",
            },
        });
        let response = self
            .client
            .post(format!("{}{}", self.base_uri, Self::CREATE_URL))
            .basic_auth(&creds.key, Some(&creds.secret))
            .json(&payload)
            .send()
            .await
            .map_err(|e| MfaError::Api(e.to_string()))?;
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MfaError::Api(e.to_string()))?;
        data["model"]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MfaError::Api("response carries no redirect url".to_string()))
    }

    /// Direct passcode validation ("access request" flow)
    pub async fn validate_passcode(
        &self,
        creds: &MfaCreds,
        identity: &str,
        passcode: &str,
    ) -> Result<bool, MfaError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_uri, Self::CHECK_URL))
            .basic_auth(&creds.key, Some(&creds.secret))
            .json(&json!({ "Identity": identity, "passCode": passcode }))
            .send()
            .await
            .map_err(|e| MfaError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MfaError::Api(format!("status {}", response.status())));
        }
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MfaError::Api(e.to_string()))?;
        Ok(data["success"] == json!(true))
    }
}

/// Process-global rendezvous between waiting Binds and the callback surface,
/// keyed by userPrincipalName
#[derive(Debug, Default)]
pub struct MfaExchange {
    slots: Mutex<HashMap<String, oneshot::Sender<String>>>,
    url_watchers: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

impl MfaExchange {
    pub fn new() -> Self {
        MfaExchange::default()
    }

    /// Register a token wait slot; overwrites (and thereby cancels) any
    /// prior wait for the same UPN
    pub async fn register(&self, upn: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(upn.to_lowercase(), tx);
        rx
    }

    /// Unconditional slot removal, called on every Bind exit path
    pub async fn remove(&self, upn: &str) {
        self.slots.lock().await.remove(&upn.to_lowercase());
    }

    /// Deliver a callback token to the waiting Bind; false when nobody waits
    pub async fn deliver(&self, upn: &str, token: String) -> bool {
        match self.slots.lock().await.remove(&upn.to_lowercase()) {
            Some(tx) => tx.send(token).is_ok(),
            None => false,
        }
    }

    /// The WS surface registers here to receive the challenge redirect URL
    pub async fn watch_urls(&self, upn: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        self.url_watchers.lock().await.insert(upn.to_lowercase(), tx);
        rx
    }

    pub async fn unwatch_urls(&self, upn: &str) {
        self.url_watchers.lock().await.remove(&upn.to_lowercase());
    }

    /// Best-effort redirect-URL push to a side-channel watcher
    pub async fn push_url(&self, upn: &str, url: String) -> bool {
        match self.url_watchers.lock().await.get(&upn.to_lowercase()) {
            Some(tx) => tx.try_send(url).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_wait_overwrites_prior_slot() {
        let exchange = MfaExchange::new();
        let first = exchange.register("user0@md.test").await;
        let second = exchange.register("user0@md.test").await;
        // the first waiter is dropped by the overwrite
        assert!(first.await.is_err());
        assert!(exchange.deliver("USER0@md.test", "token".to_string()).await);
        assert_eq!(second.await.unwrap(), "token");
    }

    #[tokio::test]
    async fn deliver_without_waiter_reports_false() {
        let exchange = MfaExchange::new();
        assert!(!exchange.deliver("ghost@md.test", "token".to_string()).await);
    }

    #[test]
    fn token_validation_checks_audience_and_signature() {
        use jsonwebtoken::{encode, EncodingKey, Header};
        #[derive(serde::Serialize)]
        struct Claims {
            uid: String,
            aud: String,
            exp: u64,
        }
        let creds = MfaCreds {
            key: "api-key".to_string(),
            secret: "api-secret".to_string(),
        };
        let claims = Claims {
            uid: "7".to_string(),
            aud: creds.key.clone(),
            exp: 4_000_000_000,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(creds.secret.as_bytes()),
        )
        .unwrap();
        let parsed = validate_token(&token, &creds).expect("valid token");
        assert_eq!(parsed.uid, "7");

        let wrong = MfaCreds {
            key: "api-key".to_string(),
            secret: "other-secret".to_string(),
        };
        assert!(validate_token(&token, &wrong).is_err());
    }
}
