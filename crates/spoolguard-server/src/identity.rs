//! OpenID Connect identity provider boundary.
//!
//! The provider is consumed as "exchange an authorization code for a
//! verified identity"; everything else about SSO lives upstream.  The
//! [`IdentityProvider`] trait keeps routes testable without a live issuer.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::OidcConfig;
use crate::error::ServerError;
use crate::session::SessionUser;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The URL to redirect the browser to for login.
    async fn authorize_url(&self, state: &str) -> Result<String, ServerError>;

    /// Exchange an authorization code for a verified identity.
    async fn exchange_code(&self, code: &str) -> Result<SessionUser, ServerError>;
}

// ---------------------------------------------------------------------------
// OIDC over HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    preferred_username: Option<String>,
    email: Option<String>,
    name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

/// Relying-party client talking to a standard OIDC issuer.
pub struct OidcProvider {
    config: OidcConfig,
    http: reqwest::Client,
}

impl OidcProvider {
    pub fn new(config: OidcConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Discovery is fetched per call rather than cached; logins are rare
    /// and issuers rotate endpoints.
    async fn discover(&self) -> Result<DiscoveryDocument, ServerError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("OIDC discovery failed: {e}")))?
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("bad OIDC discovery document: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn authorize_url(&self, state: &str) -> Result<String, ServerError> {
        let doc = self.discover().await?;
        Ok(format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope=openid%20email%20profile&state={}",
            doc.authorization_endpoint, self.config.client_id, self.config.redirect_url, state
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<SessionUser, ServerError> {
        let doc = self.discover().await?;

        let token: TokenResponse = self
            .http
            .post(&doc.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.config.redirect_url),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("token exchange failed: {e}")))?
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("bad token response: {e}")))?;

        let info: UserInfo = self
            .http
            .get(&doc.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("userinfo fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("bad userinfo response: {e}")))?;

        let email = info.email.unwrap_or_default();
        let username = info
            .preferred_username
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| email.clone());

        if username.is_empty() {
            return Err(ServerError::Upstream(
                "identity provider returned no usable identity".into(),
            ));
        }

        Ok(SessionUser {
            name: info.name.unwrap_or_else(|| username.clone()),
            username,
            email,
            groups: info.groups,
            id_token: token.id_token,
        })
    }
}
