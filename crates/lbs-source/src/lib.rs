//! Upstream lease-ledger API client: credential session, retrying HTTP, the
//! paginated balance fetcher and the per-lease detail enricher.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use lbs_core::{LeaseDetails, OutstandingBalance};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "lbs-source";

/// Fixed page size for the outstanding-balances listing.
pub const PAGE_SIZE: usize = 1000;

/// Upper bound on page requests per pass. A well-formed upstream terminates
/// via a short page long before this; the cap guarantees termination when it
/// does not.
pub const MAX_PAGES: usize = 1000;

/// A cached bearer token is refreshed once it is within this window of expiry.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Payload {
        url: String,
        source: serde_json::Error,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("pagination did not terminate within {pages} pages")]
    PaginationOverflow { pages: usize },
}

/// Read access to the source of record, as the reconciler sees it.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Retrieve every outstanding balance, across all pages.
    async fn fetch_outstanding_balances(&self) -> Result<Vec<OutstandingBalance>, SourceError>;

    /// Retrieve the descriptive fields for one lease.
    async fn fetch_lease_details(&self, lease_id: &str) -> Result<LeaseDetails, SourceError>;
}

/// How the client authenticates against the upstream API.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Static per-request headers.
    ApiKeys {
        client_id: String,
        client_secret: String,
    },
    /// Client-credentials token exchange against `{base}/token`, with the
    /// resulting bearer token cached until close to expiry.
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
}

#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Client for the upstream lease-ledger API.
#[derive(Debug)]
pub struct SourceClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    session: Mutex<Option<Session>>,
    backoff: BackoffPolicy,
}

// Wire shapes for the detail lookups. Unknown fields are ignored; missing
// nested lists and ids degrade to empty strings downstream.

#[derive(Debug, Deserialize)]
struct LeaseRecord {
    #[serde(default)]
    current_tenants: Vec<TenantRecord>,
    #[serde(default)]
    property_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TenantRecord {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    phone_numbers: Vec<PhoneRecord>,
}

#[derive(Debug, Deserialize)]
struct PhoneRecord {
    #[serde(default)]
    number: String,
}

#[derive(Debug, Deserialize)]
struct PropertyRecord {
    #[serde(default)]
    address: AddressRecord,
}

#[derive(Debug, Default, Deserialize)]
struct AddressRecord {
    #[serde(default)]
    line1: String,
}

impl SourceClient {
    pub fn new(config: SourceClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials,
            session: Mutex::new(None),
            backoff: config.backoff,
        })
    }

    /// Return a bearer token for client-secret credentials, exchanging or
    /// refreshing as needed. The session lock also serializes refreshes.
    async fn bearer_token(&self) -> Result<String, SourceError> {
        let Credentials::ClientSecret {
            client_id,
            client_secret,
        } = &self.credentials
        else {
            return Err(SourceError::Auth(
                "bearer token requested for api-key credentials".to_string(),
            ));
        };

        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_SKEW < existing.expires_at {
                return Ok(existing.access_token.clone());
            }
            debug!("cached token near expiry; refreshing");
        }

        let url = format!("{}/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(SourceError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Auth(format!(
                "token exchange failed with status {status}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(SourceError::Request)?;
        let refreshed = Session {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        };
        let access_token = refreshed.access_token.clone();
        *session = Some(refreshed);
        Ok(access_token)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SourceError> {
        match &self.credentials {
            Credentials::ApiKeys {
                client_id,
                client_secret,
            } => Ok(request
                .header("x-lbs-client-id", client_id)
                .header("x-lbs-client-secret", client_secret)
                .header(reqwest::header::ACCEPT, "application/json")),
            Credentials::ClientSecret { .. } => {
                let token = self.bearer_token().await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let request = self.authorize(self.client.get(&url)).await?;

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.bytes().await.map_err(SourceError::Request)?;
                        return serde_json::from_slice(&body).map_err(|err| {
                            SourceError::Payload {
                                url: url.clone(),
                                source: err,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::Status {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl BalanceSource for SourceClient {
    /// Page through `outstanding-balances` with a limit/offset cursor.
    ///
    /// Termination convention: the upstream returns a bare array, so the
    /// loop stops on the first short page. Pages are strictly sequential;
    /// each offset depends on the one before it.
    async fn fetch_outstanding_balances(&self) -> Result<Vec<OutstandingBalance>, SourceError> {
        let mut all = Vec::new();

        for page in 0..MAX_PAGES {
            let offset = page * PAGE_SIZE;
            let path = format!("outstanding-balances?limit={PAGE_SIZE}&offset={offset}");
            let items: Vec<OutstandingBalance> = self.get_json(&path).await?;
            let short_page = items.len() < PAGE_SIZE;
            all.extend(items);

            if short_page {
                info!(balances = all.len(), pages = page + 1, "fetched outstanding balances");
                return Ok(all);
            }
        }

        Err(SourceError::PaginationOverflow { pages: MAX_PAGES })
    }

    /// Two dependent lookups: the lease record yields the first tenant and a
    /// property reference, the property record yields the address. Missing
    /// tenants, phone numbers, property ids, or address lines all degrade to
    /// empty strings.
    async fn fetch_lease_details(&self, lease_id: &str) -> Result<LeaseDetails, SourceError> {
        let lease: LeaseRecord = self.get_json(&format!("leases/{lease_id}")).await?;

        let (tenant_name, phone_number) = match lease.current_tenants.first() {
            Some(tenant) => (
                format!("{} {}", tenant.first_name, tenant.last_name)
                    .trim()
                    .to_string(),
                tenant
                    .phone_numbers
                    .first()
                    .map(|phone| phone.number.clone())
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        let address = match &lease.property_id {
            Some(property_id) => {
                let property: PropertyRecord =
                    self.get_json(&format!("properties/{property_id}")).await?;
                property.address.line1
            }
            None => String::new(),
        };

        Ok(LeaseDetails {
            tenant_name,
            phone_number,
            address,
        })
    }
}
