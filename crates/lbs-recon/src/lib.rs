//! Reconciliation pass orchestration.
//!
//! One pass: read the sheet index, fetch every outstanding balance, classify
//! each record as update or insertion, enrich insertions, then issue two
//! batched writes. Passes are not safe to run concurrently against the same
//! sheet; callers serialize invocations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lbs_core::{NewRow, OutstandingBalance, RowUpdate};
use lbs_sheets::{
    write_mutations, SheetError, SheetStore, SheetsClient, SheetsClientConfig, WriteReport,
};
use lbs_source::{
    BackoffPolicy, BalanceSource, Credentials, SourceClient, SourceClientConfig, SourceError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbs-recon";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] SheetError),
    #[error("destination write failed: {}", .0.failure_message().unwrap_or_default())]
    Write(WriteReport),
}

/// Process-wide configuration, built once at startup and threaded through
/// constructors. No component reads the environment itself.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_base_url: String,
    pub source_credentials: Credentials,
    pub sheets_base_url: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub sheets_token: String,
    pub verify_amounts: bool,
    pub enrichment_concurrency: usize,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let client_id =
            std::env::var("LBS_SOURCE_CLIENT_ID").unwrap_or_else(|_| "dummy".to_string());
        let client_secret =
            std::env::var("LBS_SOURCE_CLIENT_SECRET").unwrap_or_else(|_| "dummy".to_string());
        let source_credentials = match std::env::var("LBS_SOURCE_AUTH").as_deref() {
            Ok("client-secret") => Credentials::ClientSecret {
                client_id,
                client_secret,
            },
            _ => Credentials::ApiKeys {
                client_id,
                client_secret,
            },
        };

        Self {
            source_base_url: std::env::var("LBS_SOURCE_BASE_URL")
                .unwrap_or_else(|_| "https://api.leaseledger.example/v1".to_string()),
            source_credentials,
            sheets_base_url: std::env::var("LBS_SHEETS_BASE_URL")
                .unwrap_or_else(|_| "https://sheets.googleapis.com/v4".to_string()),
            spreadsheet_id: std::env::var("LBS_SPREADSHEET_ID")
                .unwrap_or_else(|_| "dummy-spreadsheet".to_string()),
            sheet_name: std::env::var("LBS_SHEET_NAME").unwrap_or_else(|_| "Sheet1".to_string()),
            sheets_token: std::env::var("LBS_SHEETS_TOKEN")
                .unwrap_or_else(|_| "dummy".to_string()),
            verify_amounts: std::env::var("LBS_VERIFY_AMOUNTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            enrichment_concurrency: std::env::var("LBS_ENRICHMENT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            http_timeout_secs: std::env::var("LBS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Compare stored amounts before updating, suppressing unchanged rows.
    /// Costs one extra read per matched record, so it is off by default.
    pub verify_amounts: bool,
    pub enrichment_concurrency: usize,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            verify_amounts: false,
            enrichment_concurrency: 4,
        }
    }
}

/// Counters for one completed pass. Every source record lands in exactly one
/// of: updates written, unchanged skipped, rows appended, enrichment skipped,
/// integrity skipped.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_seen: usize,
    pub updates_written: usize,
    pub unchanged_skipped: usize,
    pub rows_appended: usize,
    pub enrichment_skipped: usize,
    pub integrity_skipped: usize,
}

impl SyncSummary {
    pub fn message(&self) -> String {
        format!(
            "Synced {} updates, added {} new rows.",
            self.updates_written, self.rows_appended
        )
    }
}

pub struct Reconciler {
    options: ReconcilerOptions,
    source: Arc<dyn BalanceSource>,
    store: Arc<dyn SheetStore>,
}

impl Reconciler {
    pub fn new(
        options: ReconcilerOptions,
        source: Arc<dyn BalanceSource>,
        store: Arc<dyn SheetStore>,
    ) -> Self {
        Self {
            options,
            source,
            store,
        }
    }

    /// Wire up the real upstream and sheet clients from configuration.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let source = SourceClient::new(SourceClientConfig {
            base_url: config.source_base_url.clone(),
            credentials: config.source_credentials.clone(),
            timeout,
            backoff: BackoffPolicy::default(),
        })?;
        let store = SheetsClient::new(SheetsClientConfig {
            base_url: config.sheets_base_url.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            sheet_name: config.sheet_name.clone(),
            access_token: config.sheets_token.clone(),
            timeout,
        })?;

        Ok(Self::new(
            ReconcilerOptions {
                verify_amounts: config.verify_amounts,
                enrichment_concurrency: config.enrichment_concurrency,
            },
            Arc::new(source),
            Arc::new(store),
        ))
    }

    /// Run one reconciliation pass.
    ///
    /// Index-read and page-fetch failures abort immediately; classification
    /// needs both complete. Per-record enrichment failures only skip that
    /// record. Nothing is written until the end, so an abort anywhere before
    /// the writer leaves the sheet untouched.
    pub async fn run_once(&self) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting reconciliation pass");

        let index = self.store.read_index().await?;
        let balances = self.source.fetch_outstanding_balances().await?;
        let records_seen = balances.len();

        let mut updates = Vec::new();
        let mut candidates = Vec::new();
        let mut unchanged_skipped = 0usize;
        let mut integrity_skipped = 0usize;

        for balance in balances {
            let lease_id = balance.lease_id.trim().to_string();
            if lease_id.is_empty() {
                warn!(%run_id, "source record with empty lease id skipped");
                integrity_skipped += 1;
                continue;
            }

            match index.get(&lease_id) {
                Some(&row) => {
                    if self.options.verify_amounts {
                        if let Some(current) = self.store.read_amount(row).await? {
                            if current == balance.amount {
                                unchanged_skipped += 1;
                                continue;
                            }
                        }
                    }
                    updates.push(RowUpdate {
                        row,
                        amount: balance.amount,
                    });
                }
                None => candidates.push(OutstandingBalance {
                    lease_id,
                    amount: balance.amount,
                }),
            }
        }

        let (new_rows, enrichment_skipped) = self.enrich_candidates(run_id, candidates).await;

        info!(
            %run_id,
            updates = updates.len(),
            insertions = new_rows.len(),
            unchanged_skipped,
            enrichment_skipped,
            integrity_skipped,
            "classification complete"
        );

        let report = write_mutations(self.store.as_ref(), &updates, &new_rows).await;
        if !report.ok() {
            return Err(SyncError::Write(report));
        }

        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records_seen,
            updates_written: report.updates.applied(),
            unchanged_skipped,
            rows_appended: report.appends.applied(),
            enrichment_skipped,
            integrity_skipped,
        };
        info!(%run_id, "{}", summary.message());
        Ok(summary)
    }

    /// Enrich insertion candidates with bounded concurrency. Each lookup is
    /// read-only and independent; results are reassembled in source order
    /// before the insertion batch is built. A failed enrichment skips that
    /// record only.
    async fn enrich_candidates(
        &self,
        run_id: Uuid,
        candidates: Vec<OutstandingBalance>,
    ) -> (Vec<NewRow>, usize) {
        let semaphore = Arc::new(Semaphore::new(self.options.enrichment_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (position, balance) in candidates.into_iter().enumerate() {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                let details = source.fetch_lease_details(&balance.lease_id).await;
                (position, balance, details)
            });
        }

        let mut enriched = Vec::new();
        let mut skipped = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let (position, balance, details) = joined.expect("enrichment task panicked");
            match details {
                Ok(details) => enriched.push((
                    position,
                    NewRow {
                        lease_id: balance.lease_id,
                        amount: balance.amount,
                        details,
                    },
                )),
                Err(err) => {
                    warn!(%run_id, lease_id = %balance.lease_id, error = %err, "enrichment failed; record skipped");
                    skipped += 1;
                }
            }
        }

        enriched.sort_by_key(|(position, _)| *position);
        (
            enriched.into_iter().map(|(_, row)| row).collect(),
            skipped,
        )
    }
}
