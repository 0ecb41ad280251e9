use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use url::Url;
use yup_oauth2::ApplicationSecret;

use super::types::{DeviceCodeResponse, OAuthErrorBody, TokenResponse};
use super::{RemoteError, TokenEndpoint};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = random_token(32);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// URL-safe random string built from `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Client of the identity platform token endpoints for one application.
#[derive(Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    authority: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
}

impl IdentityClient {
    pub fn new(client: reqwest::Client, secret: &ApplicationSecret, authority: &str) -> Self {
        Self {
            client,
            authority: authority.trim_end_matches('/').to_string(),
            client_id: secret.client_id.clone(),
            client_secret: Some(secret.client_secret.clone()).filter(|s| !s.is_empty()),
            redirect_uri: secret
                .redirect_uris
                .first()
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn endpoint(&self, tenant_id: &str, name: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{}", self.authority, tenant_id, name)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        mut form: Vec<(&str, String)>,
    ) -> Result<T, RemoteError> {
        form.push(("client_id", self.client_id.clone()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self.client.post(url).form(&form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(super::classify_graph_error(status, &headers, &body));
        }

        // 400/401 from the token endpoint carry an OAuth error code.
        let parsed: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
        Err(RemoteError::OAuth {
            code: parsed.error.unwrap_or_else(|| format!("http_{}", status.as_u16())),
            description: parsed.error_description.unwrap_or_default(),
        })
    }
}

fn scope_string(scopes: &[String]) -> String {
    scopes.join(" ")
}

#[async_trait]
impl TokenEndpoint for IdentityClient {
    fn authorization_url(
        &self,
        tenant_id: &str,
        scopes: &[String],
        state: &str,
        code_challenge: &str,
    ) -> String {
        let base = self.endpoint(tenant_id, "authorize");
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("client_id", &self.client_id)
                    .append_pair("response_type", "code")
                    .append_pair("redirect_uri", &self.redirect_uri)
                    .append_pair("response_mode", "query")
                    .append_pair("scope", &scope_string(scopes))
                    .append_pair("state", state)
                    .append_pair("code_challenge", code_challenge)
                    .append_pair("code_challenge_method", "S256");
                url.to_string()
            }
            Err(_) => base,
        }
    }

    async fn request_device_code(
        &self,
        tenant_id: &str,
        scopes: &[String],
    ) -> Result<DeviceCodeResponse, RemoteError> {
        let url = self.endpoint(tenant_id, "devicecode");
        // The device code endpoint rejects client secrets; send the id only.
        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", scope_string(scopes).as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
        Err(RemoteError::OAuth {
            code: parsed.error.unwrap_or_else(|| format!("http_{}", status.as_u16())),
            description: parsed.error_description.unwrap_or_default(),
        })
    }

    async fn exchange_code(
        &self,
        tenant_id: &str,
        code: &str,
        code_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, RemoteError> {
        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("code_verifier", code_verifier.to_string()),
            ("scope", scope_string(scopes)),
        ];
        self.post_form(&self.endpoint(tenant_id, "token"), form).await
    }

    async fn poll_device_code(
        &self,
        tenant_id: &str,
        device_code: &str,
    ) -> Result<TokenResponse, RemoteError> {
        let form = vec![
            ("grant_type", DEVICE_CODE_GRANT.to_string()),
            ("device_code", device_code.to_string()),
        ];
        self.post_form(&self.endpoint(tenant_id, "token"), form).await
    }

    async fn refresh(
        &self,
        tenant_id: &str,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, RemoteError> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("scope", scope_string(scopes)),
        ];
        self.post_form(&self.endpoint(tenant_id, "token"), form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IdentityClient {
        let secret = ApplicationSecret {
            client_id: "app-1".to_string(),
            redirect_uris: vec!["http://localhost:5000/auth/callback".to_string()],
            ..Default::default()
        };
        IdentityClient::new(
            reqwest::Client::new(),
            &secret,
            "https://login.microsoftonline.com/",
        )
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let url = client().authorization_url(
            "contoso",
            &["offline_access".to_string(), "Mail.Read".to_string()],
            "st-1",
            "ch-1",
        );
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(
            parsed.path(),
            "/contoso/oauth2/v2.0/authorize"
        );
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".to_string(), "st-1".to_string())));
        assert!(pairs.contains(&("code_challenge_method".to_string(), "S256".to_string())));
        assert!(pairs.contains(&("scope".to_string(), "offline_access Mail.Read".to_string())));
    }

    #[test]
    fn empty_client_secret_is_not_sent() {
        assert!(client().client_secret.is_none());
    }
}
