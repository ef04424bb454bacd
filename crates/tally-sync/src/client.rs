//! REST client for the dashboard backend.
//!
//! Every authenticated call goes through [`DashboardClient::send`], which
//! refreshes the session once on an expired token and retries transient
//! failures for reads. Writes are never retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::key::{CacheKey, PAGE_SIZE_PARAM};
use crate::query::PageSource;
use crate::types::{EntityId, EntityTag, Page, Payment, PaymentInput, Record, Session};
use crate::SyncError;

/// Retries after the first attempt for transient read failures.
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Whether a request may be retried after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Transient,
    Never,
}

/// Client for the dashboard REST API.
pub struct DashboardClient {
    http: Client,
    api_url: String,
    default_page_size: u32,
    session: Arc<RwLock<Option<Session>>>,
}

impl DashboardClient {
    /// Create a client with default timeouts.
    pub fn new(api_url: impl Into<String>) -> Self {
        let config = SyncConfig {
            api_url: api_url.into(),
            ..SyncConfig::default()
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            default_page_size: config.default_page_size,
            session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Install tokens obtained elsewhere.
    pub async fn set_session(&self, session: Session) {
        *self.session.write().await = Some(session);
    }

    pub async fn username(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.username.clone())
    }

    /// Authenticate with username and password.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SyncError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            username: &'a str,
            password: &'a str,
        }

        let url = format!("{}/auth/login/", self.api_url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                SyncError::Auth(format!(
                    "login failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(SyncError::Auth(format!("login failed ({}): {}", status, text)));
        }

        let mut session: Session = response.json().await?;
        session.username.get_or_insert_with(|| username.to_string());
        debug!(username = %username, "authenticated with dashboard API");

        *self.session.write().await = Some(session);
        Ok(())
    }

    /// Exchange the refresh token for new session tokens.
    pub async fn refresh_session(&self) -> Result<(), SyncError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let (refresh_token, username) = {
            let session = self.session.read().await;
            session
                .as_ref()
                .map(|s| (s.refresh_token.clone(), s.username.clone()))
                .ok_or_else(|| SyncError::Auth("no session to refresh".to_string()))?
        };

        let url = format!("{}/auth/refresh/", self.api_url);
        let response = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                SyncError::Auth(format!(
                    "refresh failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(SyncError::Auth(format!(
                "refresh failed ({}): {}",
                status, text
            )));
        }

        let mut session: Session = response.json().await?;
        if session.username.is_none() {
            session.username = username;
        }
        debug!("refreshed session");

        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn access_token(&self) -> Result<String, SyncError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or_else(|| SyncError::Auth("not authenticated".to_string()))
    }

    /// Send an authenticated request built by `build`.
    ///
    /// An expired token triggers exactly one refresh and retry; a second
    /// rejection becomes `SyncError::Auth`.
    async fn send<F>(&self, retry: Retry, build: F) -> Result<Value, SyncError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        let mut attempt = 0;
        loop {
            let token = self.access_token().await?;
            let result = match build(&self.http).bearer_auth(token).send().await {
                Ok(response) => self.handle_response(response).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth_expiry() => {
                    if refreshed {
                        return Err(SyncError::Auth(format!(
                            "credentials rejected after refresh: {}",
                            e
                        )));
                    }
                    refreshed = true;
                    if let Err(refresh_error) = self.refresh_session().await {
                        warn!(error = %refresh_error, "failed to auto-refresh session");
                        return Err(refresh_error);
                    }
                    debug!("automatically refreshed expired session");
                }
                Err(e)
                    if retry == Retry::Transient
                        && e.is_transient()
                        && attempt < MAX_TRANSIENT_RETRIES =>
                {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map a response to its JSON body. Empty bodies become `Value::Null`.
    async fn handle_response(&self, response: reqwest::Response) -> Result<Value, SyncError> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(SyncError::RateLimited { retry_after_secs });
        }

        let text = response.text().await.map_err(|e| {
            SyncError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .and_then(ApiErrorBody::into_message)
                .unwrap_or(text);
            return Err(SyncError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn collection_url(&self, key: &CacheKey) -> String {
        match key {
            CacheKey::List { tag, .. } => format!("{}/{}/", self.api_url, tag.endpoint()),
            CacheKey::Linked { tag, parent, .. } => format!(
                "{}/{}/{}/{}/",
                self.api_url,
                parent.tag.endpoint(),
                parent.id,
                tag.endpoint()
            ),
            CacheKey::Detail { tag, id } => self.entity_url(*tag, *id),
        }
    }

    fn entity_url(&self, tag: EntityTag, id: EntityId) -> String {
        format!("{}/{}/{}/", self.api_url, tag.endpoint(), id)
    }

    /// Fetch one page of a list or linked collection. Detail keys yield a
    /// single-item page.
    pub async fn list_page(&self, key: &CacheKey, page: u32) -> Result<Page, SyncError> {
        if let CacheKey::Detail { tag, id } = key {
            let record = self.get(*tag, *id).await?;
            return Ok(Page::new(1, 1, vec![record]).with_total(1));
        }

        let url = self.collection_url(key);
        let mut query: Vec<(String, String)> = vec![("page".to_string(), page.to_string())];
        let page_size = key
            .filter()
            .and_then(|f| f.page_size_value())
            .unwrap_or(self.default_page_size);
        query.push((PAGE_SIZE_PARAM.to_string(), page_size.to_string()));
        if let Some(filter) = key.filter() {
            query.extend(
                filter
                    .query_pairs()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
        }

        debug!(key = %key, page, "fetching page");
        let body = self
            .send(Retry::Transient, |http| http.get(&url).query(&query))
            .await?;
        let page: Page = serde_json::from_value(body)?;
        if page.items.iter().any(|r| r.id().is_none()) {
            return Err(SyncError::InvalidResponse(format!(
                "{} page {} has items without an id",
                key, page.page_number
            )));
        }
        Ok(page)
    }

    /// Fetch one entity.
    pub async fn get(&self, tag: EntityTag, id: EntityId) -> Result<Record, SyncError> {
        let url = self.entity_url(tag, id);
        match self.send(Retry::Transient, |http| http.get(&url)).await {
            Ok(body) => Ok(serde_json::from_value(body)?),
            Err(SyncError::Api { status: 404, .. }) => Err(SyncError::NotFound {
                resource: tag.to_string(),
                id,
            }),
            Err(e) => Err(e),
        }
    }

    /// Create an entity. The server answers with the entity or a
    /// `{ "message": ... }` body.
    pub async fn create(&self, tag: EntityTag, body: &Record) -> Result<Value, SyncError> {
        let url = format!("{}/{}/", self.api_url, tag.endpoint());
        self.write(Method::POST, &url, Some(body)).await
    }

    /// Partially update an entity.
    pub async fn update(
        &self,
        tag: EntityTag,
        id: EntityId,
        fields: &Record,
    ) -> Result<Value, SyncError> {
        let url = self.entity_url(tag, id);
        self.write(Method::PATCH, &url, Some(fields)).await
    }

    /// Delete an entity. Returns the server's message body, or `Null` for an
    /// empty response.
    pub async fn delete(&self, tag: EntityTag, id: EntityId) -> Result<Value, SyncError> {
        let url = self.entity_url(tag, id);
        self.write(Method::DELETE, &url, None).await
    }

    /// Record a payment against a purchase.
    pub async fn pay_purchase(
        &self,
        purchase_id: EntityId,
        input: &PaymentInput,
    ) -> Result<Payment, SyncError> {
        self.pay(EntityTag::Purchases, purchase_id, input).await
    }

    /// Record a payment against a sale.
    pub async fn pay_sale(
        &self,
        sale_id: EntityId,
        input: &PaymentInput,
    ) -> Result<Payment, SyncError> {
        self.pay(EntityTag::Sales, sale_id, input).await
    }

    async fn pay(
        &self,
        parent: EntityTag,
        id: EntityId,
        input: &PaymentInput,
    ) -> Result<Payment, SyncError> {
        let url = format!("{}/{}/{}/payments/", self.api_url, parent.endpoint(), id);
        let body = Record::from_entity(input)?;
        match self.write(Method::POST, &url, Some(&body)).await? {
            Value::Object(map) if map.contains_key("id") => {
                Ok(serde_json::from_value(Value::Object(map))?)
            }
            Value::Object(map) => Err(SyncError::Rejected(
                map.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("payment not recorded")
                    .to_string(),
            )),
            other => Err(SyncError::InvalidResponse(format!(
                "expected payment, got {}",
                other
            ))),
        }
    }

    async fn write(
        &self,
        method: Method,
        url: &str,
        body: Option<&Record>,
    ) -> Result<Value, SyncError> {
        debug!(method = %method, url = %url, "sending write");
        self.send(Retry::Never, |http| {
            let request = http.request(method.clone(), url);
            match body {
                Some(body) => request.json(body),
                None => request,
            }
        })
        .await
    }
}

#[async_trait]
impl PageSource for DashboardClient {
    async fn fetch_page(
        &self,
        key: &CacheKey,
        page: u32,
        cancel: CancellationToken,
    ) -> Result<Page, SyncError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.list_page(key, page) => result,
        }
    }
}

impl std::fmt::Debug for DashboardClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

/// Error body shapes the backend uses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl ApiErrorBody {
    fn into_message(self) -> Option<String> {
        let text = self.detail.or(self.message).or(self.error)?;
        Some(match self.code {
            Some(code) => format!("{} ({})", text, code),
            None => text,
        })
    }
}
