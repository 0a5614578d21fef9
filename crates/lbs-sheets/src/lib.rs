//! Destination spreadsheet client: the values API, the lease-id index
//! reader, and the batched mutation writer.
//!
//! The column layout is wire contract: tenant name in A, address in B, phone
//! in C, amount in E, lease id in AA, 27 cells per appended row. Data rows
//! start at row 3; rows 1 and 2 are header/metadata.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lbs_core::{NewRow, RowUpdate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "lbs-sheets";

/// First row of the data range; everything above is header.
pub const FIRST_DATA_ROW: u32 = 3;

/// Cells per appended row, columns A through AA.
pub const ROW_WIDTH: usize = 27;

pub const TENANT_NAME_COL: usize = 0;
pub const ADDRESS_COL: usize = 1;
pub const PHONE_COL: usize = 2;
pub const AMOUNT_COL: usize = 4;
pub const LEASE_ID_COL: usize = 26;

const AMOUNT_COLUMN: &str = "E";
const LEASE_ID_COLUMN: &str = "AA";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheet request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sheet status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed sheet payload from {url}: {source}")]
    Payload {
        url: String,
        source: serde_json::Error,
    },
    #[error("duplicate lease id {lease_id} in sheet (rows {first_row} and {second_row})")]
    DuplicateLeaseId {
        lease_id: String,
        first_row: u32,
        second_row: u32,
    },
}

/// Lease id to absolute 1-based row position, built once per pass.
pub type SheetIndex = BTreeMap<String, u32>;

/// Destination store operations, as the reconciler sees them.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Build the lease-id index from the id column. Never fails on an empty
    /// column; duplicate ids are a data-integrity error.
    async fn read_index(&self) -> Result<SheetIndex, SheetError>;

    /// Read the currently stored amount at a row. Blank or unparsable cells
    /// read as `None`.
    async fn read_amount(&self, row: u32) -> Result<Option<Decimal>, SheetError>;

    /// Apply all updates in one batched multi-range write. Returns the
    /// number of ranges written.
    async fn batch_update(&self, updates: &[RowUpdate]) -> Result<usize, SheetError>;

    /// Append all rows in one batched append. Returns the number of rows
    /// appended. Appends are not idempotent: re-running a pass before the
    /// index reflects earlier appends duplicates rows.
    async fn append_rows(&self, rows: &[NewRow]) -> Result<usize, SheetError>;
}

#[derive(Debug, Clone)]
pub struct SheetsClientConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub access_token: String,
    pub timeout: Duration,
}

/// Values-API client for one spreadsheet. The bearer token is an opaque
/// injected dependency; credential acquisition lives with the caller.
#[derive(Debug)]
pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    sheet_name: String,
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl SheetsClient {
    pub fn new(config: SheetsClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: config.spreadsheet_id,
            sheet_name: config.sheet_name,
            access_token: config.access_token,
        })
    }

    fn values_url(&self, suffix: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values{}",
            self.base_url, self.spreadsheet_id, suffix
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SheetError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(SheetError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            })
        }
    }

    async fn get_values(&self, range: &str) -> Result<ValueRange, SheetError> {
        let url = self.values_url(&format!("/{range}"));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(SheetError::Request)?;
        let response = Self::check(response).await?;
        let body = response.bytes().await.map_err(SheetError::Request)?;
        serde_json::from_slice(&body).map_err(|err| SheetError::Payload { url, source: err })
    }
}

#[async_trait]
impl SheetStore for SheetsClient {
    /// Row positions are absolute: `FIRST_DATA_ROW + offset within the
    /// fetched range`. Blank cells are skipped but still advance the count.
    async fn read_index(&self) -> Result<SheetIndex, SheetError> {
        let range = format!(
            "{}!{}{}:{}",
            self.sheet_name, LEASE_ID_COLUMN, FIRST_DATA_ROW, LEASE_ID_COLUMN
        );
        let value_range = self.get_values(&range).await?;

        let mut index = SheetIndex::new();
        for (offset, cells) in value_range.values.iter().enumerate() {
            let row_number = FIRST_DATA_ROW + offset as u32;
            let Some(cell) = cells.first() else { continue };
            let lease_id = cell.trim();
            if lease_id.is_empty() {
                continue;
            }
            if let Some(&first_row) = index.get(lease_id) {
                return Err(SheetError::DuplicateLeaseId {
                    lease_id: lease_id.to_string(),
                    first_row,
                    second_row: row_number,
                });
            }
            index.insert(lease_id.to_string(), row_number);
        }

        Ok(index)
    }

    async fn read_amount(&self, row: u32) -> Result<Option<Decimal>, SheetError> {
        let range = format!("{}!{}{}", self.sheet_name, AMOUNT_COLUMN, row);
        let value_range = self.get_values(&range).await?;
        let amount = value_range
            .values
            .first()
            .and_then(|cells| cells.first())
            .and_then(|cell| Decimal::from_str(cell.trim()).ok());
        Ok(amount)
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> Result<usize, SheetError> {
        let data: Vec<JsonValue> = updates
            .iter()
            .map(|update| {
                json!({
                    "range": format!("{}!{}{}", self.sheet_name, AMOUNT_COLUMN, update.row),
                    "values": [[amount_cell(update.amount)]],
                })
            })
            .collect();

        let url = self.values_url(":batchUpdate");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "valueInputOption": "RAW", "data": data }))
            .send()
            .await
            .map_err(SheetError::Request)?;
        Self::check(response).await?;
        Ok(updates.len())
    }

    async fn append_rows(&self, rows: &[NewRow]) -> Result<usize, SheetError> {
        let values: Vec<Vec<JsonValue>> = rows.iter().map(render_row).collect();
        let url = self.values_url(&format!(
            "/{}!A{}:{}:append",
            self.sheet_name, FIRST_DATA_ROW, LEASE_ID_COLUMN
        ));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": values }))
            .send()
            .await
            .map_err(SheetError::Request)?;
        Self::check(response).await?;
        Ok(rows.len())
    }
}

/// Render one appended row into the fixed 27-cell layout. Columns without an
/// owner in this system stay blank.
pub fn render_row(row: &NewRow) -> Vec<JsonValue> {
    let mut cells = vec![JsonValue::String(String::new()); ROW_WIDTH];
    cells[TENANT_NAME_COL] = JsonValue::String(row.details.tenant_name.clone());
    cells[ADDRESS_COL] = JsonValue::String(row.details.address.clone());
    cells[PHONE_COL] = JsonValue::String(row.details.phone_number.clone());
    cells[AMOUNT_COL] = amount_cell(row.amount);
    cells[LEASE_ID_COL] = JsonValue::String(row.lease_id.clone());
    cells
}

fn amount_cell(amount: Decimal) -> JsonValue {
    amount
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(amount.to_string()))
}

/// Per-batch result of one writer invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum BatchOutcome {
    Applied(usize),
    Skipped,
    Failed(String),
}

impl BatchOutcome {
    pub fn applied(&self) -> usize {
        match self {
            BatchOutcome::Applied(count) => *count,
            _ => 0,
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self, BatchOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WriteReport {
    pub updates: BatchOutcome,
    pub appends: BatchOutcome,
}

impl WriteReport {
    pub fn ok(&self) -> bool {
        !self.updates.failed() && !self.appends.failed()
    }

    pub fn failure_message(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let BatchOutcome::Failed(message) = &self.updates {
            parts.push(format!("updates: {message}"));
        }
        if let BatchOutcome::Failed(message) = &self.appends {
            parts.push(format!("appends: {message}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Apply both change-sets. The two batches are independent: a failed update
/// batch must not prevent the append batch, and the report records each
/// outcome separately. Empty change-sets skip their call entirely.
pub async fn write_mutations(
    store: &dyn SheetStore,
    updates: &[RowUpdate],
    new_rows: &[NewRow],
) -> WriteReport {
    let update_outcome = if updates.is_empty() {
        BatchOutcome::Skipped
    } else {
        match store.batch_update(updates).await {
            Ok(count) => BatchOutcome::Applied(count),
            Err(err) => {
                warn!(error = %err, "update batch failed");
                BatchOutcome::Failed(err.to_string())
            }
        }
    };

    let append_outcome = if new_rows.is_empty() {
        BatchOutcome::Skipped
    } else {
        match store.append_rows(new_rows).await {
            Ok(count) => BatchOutcome::Applied(count),
            Err(err) => {
                warn!(error = %err, "append batch failed");
                BatchOutcome::Failed(err.to_string())
            }
        }
    };

    WriteReport {
        updates: update_outcome,
        appends: append_outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbs_core::LeaseDetails;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> SheetsClient {
        SheetsClient::new(SheetsClientConfig {
            base_url: base_url.to_string(),
            spreadsheet_id: "sheet-1".to_string(),
            sheet_name: "Ledger".to_string(),
            access_token: "token".to_string(),
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    fn new_row(lease_id: &str, amount: &str) -> NewRow {
        NewRow {
            lease_id: lease_id.to_string(),
            amount: amount.parse().unwrap(),
            details: LeaseDetails {
                tenant_name: "Jane Doe".to_string(),
                phone_number: "555-1111".to_string(),
                address: "1 Main St".to_string(),
            },
        }
    }

    #[test]
    fn rendered_row_matches_column_contract() {
        let cells = render_row(&new_row("L1", "100.0"));

        assert_eq!(cells.len(), ROW_WIDTH);
        assert_eq!(cells[TENANT_NAME_COL], json!("Jane Doe"));
        assert_eq!(cells[ADDRESS_COL], json!("1 Main St"));
        assert_eq!(cells[PHONE_COL], json!("555-1111"));
        assert_eq!(cells[AMOUNT_COL], json!(100.0));
        assert_eq!(cells[LEASE_ID_COL], json!("L1"));
        for (i, cell) in cells.iter().enumerate() {
            if ![TENANT_NAME_COL, ADDRESS_COL, PHONE_COL, AMOUNT_COL, LEASE_ID_COL].contains(&i) {
                assert_eq!(cell, &json!(""), "column {i} should be blank");
            }
        }
    }

    #[tokio::test]
    async fn index_uses_absolute_row_positions_across_blanks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!AA3:AA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [["L1"], [], ["L3"], [""], ["L5"]]
            })))
            .mount(&server)
            .await;

        let index = client(&server.uri()).read_index().await.expect("index");

        assert_eq!(index.get("L1"), Some(&3));
        assert_eq!(index.get("L3"), Some(&5));
        assert_eq!(index.get("L5"), Some(&7));
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn empty_id_column_yields_empty_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!AA3:AA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let index = client(&server.uri()).read_index().await.expect("index");
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn duplicate_lease_id_is_a_data_integrity_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!AA3:AA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [["L1"], ["L1"]]
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri()).read_index().await.unwrap_err();
        match err {
            SheetError::DuplicateLeaseId {
                lease_id,
                first_row,
                second_row,
            } => {
                assert_eq!(lease_id, "L1");
                assert_eq!(first_row, 3);
                assert_eq!(second_row, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn read_amount_parses_cell_or_reads_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!E5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [["150.25"]]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!E6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        assert_eq!(
            client.read_amount(5).await.expect("read"),
            Some("150.25".parse().unwrap())
        );
        assert_eq!(client.read_amount(6).await.expect("read"), None);
    }

    #[tokio::test]
    async fn batch_update_sends_one_multi_range_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/spreadsheets/sheet-1/values:batchUpdate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let updates = vec![
            RowUpdate {
                row: 5,
                amount: "150.0".parse().unwrap(),
            },
            RowUpdate {
                row: 9,
                amount: "-20.5".parse().unwrap(),
            },
        ];
        let written = client(&server.uri())
            .batch_update(&updates)
            .await
            .expect("update");
        assert_eq!(written, 2);

        let requests = server.received_requests().await.expect("recording enabled");
        let body: serde_json::Value =
            serde_json::from_slice(&requests[0].body).expect("json body");
        assert_eq!(body["valueInputOption"], json!("RAW"));
        assert_eq!(body["data"][0]["range"], json!("Ledger!E5"));
        assert_eq!(body["data"][0]["values"], json!([[150.0]]));
        assert_eq!(body["data"][1]["range"], json!("Ledger!E9"));
        assert_eq!(body["data"][1]["values"], json!([[-20.5]]));
    }

    #[tokio::test]
    async fn append_sends_one_batched_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!A3:AA:append"))
            .and(query_param("valueInputOption", "RAW"))
            .and(query_param("insertDataOption", "INSERT_ROWS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![new_row("L1", "100.0"), new_row("L2", "42.0")];
        let appended = client(&server.uri())
            .append_rows(&rows)
            .await
            .expect("append");
        assert_eq!(appended, 2);

        let requests = server.received_requests().await.expect("recording enabled");
        let body: serde_json::Value =
            serde_json::from_slice(&requests[0].body).expect("json body");
        let values = body["values"].as_array().expect("values array");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0][LEASE_ID_COL], json!("L1"));
        assert_eq!(values[1][LEASE_ID_COL], json!("L2"));
    }

    #[tokio::test]
    async fn destination_failure_surfaces_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spreadsheets/sheet-1/values/Ledger!AA3:AA"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server.uri()).read_index().await.unwrap_err();
        assert!(matches!(err, SheetError::Status { status: 500, .. }));
    }

    #[derive(Default)]
    struct RecordingStore {
        fail_updates: bool,
        updates_seen: Mutex<Vec<RowUpdate>>,
        appends_seen: Mutex<Vec<NewRow>>,
    }

    #[async_trait]
    impl SheetStore for RecordingStore {
        async fn read_index(&self) -> Result<SheetIndex, SheetError> {
            Ok(SheetIndex::new())
        }

        async fn read_amount(&self, _row: u32) -> Result<Option<Decimal>, SheetError> {
            Ok(None)
        }

        async fn batch_update(&self, updates: &[RowUpdate]) -> Result<usize, SheetError> {
            if self.fail_updates {
                return Err(SheetError::Status {
                    status: 500,
                    url: "batchUpdate".to_string(),
                });
            }
            self.updates_seen.lock().unwrap().extend_from_slice(updates);
            Ok(updates.len())
        }

        async fn append_rows(&self, rows: &[NewRow]) -> Result<usize, SheetError> {
            self.appends_seen.lock().unwrap().extend_from_slice(rows);
            Ok(rows.len())
        }
    }

    #[tokio::test]
    async fn failed_update_batch_still_attempts_append() {
        let store = RecordingStore {
            fail_updates: true,
            ..RecordingStore::default()
        };
        let updates = vec![RowUpdate {
            row: 5,
            amount: "1.0".parse().unwrap(),
        }];
        let rows = vec![new_row("L1", "100.0")];

        let report = write_mutations(&store, &updates, &rows).await;

        assert!(!report.ok());
        assert!(report.updates.failed());
        assert_eq!(report.appends, BatchOutcome::Applied(1));
        assert_eq!(store.appends_seen.lock().unwrap().len(), 1);
        assert!(report.failure_message().unwrap().contains("updates:"));
    }

    #[tokio::test]
    async fn empty_change_sets_skip_their_batch() {
        let store = RecordingStore::default();
        let report = write_mutations(&store, &[], &[]).await;

        assert!(report.ok());
        assert_eq!(report.updates, BatchOutcome::Skipped);
        assert_eq!(report.appends, BatchOutcome::Skipped);
        assert!(store.updates_seen.lock().unwrap().is_empty());
        assert!(store.appends_seen.lock().unwrap().is_empty());
    }
}
