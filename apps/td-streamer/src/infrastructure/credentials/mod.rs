//! HTTP Credential Supplier
//!
//! Exchanges a long-lived refresh token for short-lived access tokens and
//! reads the streamer connection info from the user principals endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;

use crate::application::ports::{CredentialError, CredentialSupplier};
use crate::domain::session::StreamingCredentials;

/// Default REST base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://api.tdameritrade.com/v1";

/// Access tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

const fn default_expires_in() -> u64 {
    1800
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPrincipals {
    accounts: Vec<PrincipalAccount>,
    streamer_info: StreamerInfo,
    streamer_subscription_keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrincipalAccount {
    account_id: String,
    company: String,
    segment: String,
    account_cd_domain_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamerInfo {
    streamer_socket_url: String,
    token: String,
    token_timestamp: String,
    user_group: String,
    access_level: String,
    acl: String,
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    keys: Vec<SubscriptionKey>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKey {
    key: String,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

// =============================================================================
// Supplier
// =============================================================================

/// OAuth refresh-token backed supplier.
pub struct HttpCredentialSupplier {
    client: Client,
    base_url: String,
    client_id: String,
    refresh_token: String,
    account_id: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for HttpCredentialSupplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentialSupplier")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl HttpCredentialSupplier {
    /// Create a supplier against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CredentialError::RequestFailed {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            refresh_token: refresh_token.into(),
            account_id: None,
            token: Mutex::new(None),
        })
    }

    /// Use this account instead of the first one listed.
    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .as_ref()
            .filter(|token| Instant::now() < token.refresh_at)
            .map(|token| token.value.clone())
    }

    async fn refresh(&self) -> Result<String, CredentialError> {
        let url = format!("{}/oauth2/token", self.base_url);
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::RequestFailed {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::RefreshFailed {
                message: format!("{status}: {body}"),
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| CredentialError::InvalidResponse {
                    message: e.to_string(),
                })?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        tracing::debug!(expires_in = token.expires_in, "Access token refreshed");
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn user_principals(&self) -> Result<UserPrincipals, CredentialError> {
        let bearer = self.bearer_token().await?;
        let url = format!("{}/userprincipals", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .query(&[("fields", "streamerSubscriptionKeys,streamerConnectionInfo")])
            .send()
            .await
            .map_err(|e| CredentialError::RequestFailed {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.token.lock().take();
            }
            return Err(CredentialError::RequestFailed {
                message: format!("user principals returned {status}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse {
                message: e.to_string(),
            })
    }

    fn to_credentials(&self, principals: UserPrincipals) -> Result<StreamingCredentials, CredentialError> {
        let UserPrincipals {
            accounts,
            streamer_info: info,
            streamer_subscription_keys: keys,
        } = principals;

        let account = match &self.account_id {
            Some(id) => accounts.into_iter().find(|account| &account.account_id == id),
            None => accounts.into_iter().next(),
        }
        .ok_or_else(|| CredentialError::InvalidResponse {
            message: "no matching account in user principals".to_string(),
        })?;

        let subscription_key = keys
            .keys
            .into_iter()
            .next()
            .map(|key| key.key)
            .ok_or_else(|| CredentialError::InvalidResponse {
                message: "no streamer subscription key".to_string(),
            })?;

        Ok(StreamingCredentials {
            user_id: account.account_id,
            token: info.token,
            company: account.company,
            segment: account.segment,
            cd_domain: account.account_cd_domain_id,
            user_group: info.user_group,
            access_level: info.access_level,
            app_id: info.app_id,
            acl: info.acl,
            token_timestamp_ms: parse_token_timestamp(&info.token_timestamp)?,
            socket_url: format!("wss://{}/ws", info.streamer_socket_url),
            subscription_key,
        })
    }
}

/// Parse `2019-08-22T14:24:23+0000` into epoch milliseconds.
fn parse_token_timestamp(raw: &str) -> Result<i64, CredentialError> {
    DateTime::parse_from_str(raw, TOKEN_TIMESTAMP_FORMAT)
        .map(|ts| ts.timestamp_millis())
        .map_err(|e| CredentialError::InvalidResponse {
            message: format!("tokenTimestamp {raw:?}: {e}"),
        })
}

#[async_trait]
impl CredentialSupplier for HttpCredentialSupplier {
    async fn streaming_credentials(&self) -> Result<StreamingCredentials, CredentialError> {
        let principals = self.user_principals().await?;
        let credentials = self.to_credentials(principals)?;
        tracing::info!(
            account = %credentials.user_id,
            socket_url = %credentials.socket_url,
            "Streamer credentials fetched"
        );
        Ok(credentials)
    }

    async fn bearer_token(&self) -> Result<String, CredentialError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn principals() -> serde_json::Value {
        json!({
            "accounts": [
                {"accountId": "111", "company": "AMER", "segment": "AMER", "accountCdDomainId": "A000001"},
                {"accountId": "222", "company": "AMER", "segment": "ADVNCED", "accountCdDomainId": "A000002"}
            ],
            "streamerInfo": {
                "streamerSocketUrl": "streamer-ws.example.com",
                "token": "sess-token",
                "tokenTimestamp": "2019-08-22T14:24:23+0000",
                "userGroup": "ACCT",
                "accessLevel": "ACCT",
                "acl": "AKBR",
                "appId": "APP1"
            },
            "streamerSubscriptionKeys": {"keys": [{"key": "sub-key"}]}
        })
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_id=CLIENT%40AMER.OAUTHAP"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "access-1", "expires_in": 1800})),
            )
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn supplier(server: &MockServer) -> HttpCredentialSupplier {
        HttpCredentialSupplier::new(server.uri(), "CLIENT@AMER.OAUTHAP", "refresh-1").unwrap()
    }

    #[tokio::test]
    async fn maps_user_principals() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/userprincipals"))
            .and(query_param(
                "fields",
                "streamerSubscriptionKeys,streamerConnectionInfo",
            ))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(principals()))
            .mount(&server)
            .await;

        let creds = supplier(&server).streaming_credentials().await.unwrap();
        assert_eq!(creds.user_id, "111");
        assert_eq!(creds.cd_domain, "A000001");
        assert_eq!(creds.socket_url, "wss://streamer-ws.example.com/ws");
        assert_eq!(creds.subscription_key, "sub-key");
        assert_eq!(creds.token_timestamp_ms, 1_566_483_863_000);
        assert_eq!(creds.app_id, "APP1");
    }

    #[tokio::test]
    async fn selects_configured_account() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/userprincipals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(principals()))
            .mount(&server)
            .await;

        let creds = supplier(&server)
            .with_account("222")
            .streaming_credentials()
            .await
            .unwrap();
        assert_eq!(creds.user_id, "222");
        assert_eq!(creds.segment, "ADVNCED");
    }

    #[tokio::test]
    async fn access_token_is_cached() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;

        let supplier = supplier(&server);
        assert_eq!(supplier.bearer_token().await.unwrap(), "access-1");
        assert_eq!(supplier.bearer_token().await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn rejected_refresh_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = supplier(&server).streaming_credentials().await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed { .. }));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn missing_subscription_key_is_invalid() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        let mut body = principals();
        body["streamerSubscriptionKeys"]["keys"] = json!([]);
        Mock::given(method("GET"))
            .and(path("/userprincipals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let err = supplier(&server).streaming_credentials().await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidResponse { .. }));
    }

    #[test]
    fn token_timestamp_format() {
        assert_eq!(
            parse_token_timestamp("1970-01-01T00:00:01+0000").unwrap(),
            1000
        );
        assert!(parse_token_timestamp("yesterday").is_err());
    }
}
