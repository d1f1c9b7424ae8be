//! Minimal Horizon REST client.
//!
//! Only the endpoints the bridge consumes are modeled: paged account
//! transactions, per-transaction payment operations, account details and
//! transaction submission. The [`TransactionFetcher`] and [`HorizonAccounts`]
//! traits are the seams the rest of the crate (and the tests) work against.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use super::PAGE_LIMIT;
use crate::error::SubmitError;

/// One page of account transactions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionPage {
    pub records: Vec<TransactionRecord>,
}

/// The Horizon transaction fields the bridge consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub paging_token: String,
    pub source_account: String,
    #[serde(default)]
    pub memo_type: String,
    /// Base64-encoded for `hash` and `return` memo types.
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub successful: bool,
}

impl TransactionRecord {
    /// Decode a `hash` or `return` memo into its raw 32 bytes.
    pub fn decoded_memo(&self) -> Option<[u8; 32]> {
        if self.memo_type != "hash" && self.memo_type != "return" {
            return None;
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.memo.as_deref()?)
            .ok()?;
        raw.try_into().ok()
    }
}

/// A payment operation inside a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRecord {
    #[serde(rename = "type")]
    pub type_str: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub asset_type: String,
    #[serde(default)]
    pub asset_code: Option<String>,
    #[serde(default)]
    pub asset_issuer: Option<String>,
    #[serde(default)]
    pub amount: String,
}

/// Account details: sequence, signers and thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountRecord {
    pub account_id: String,
    pub sequence: String,
    pub thresholds: Thresholds,
    pub signers: Vec<AccountSigner>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    pub low_threshold: u8,
    pub med_threshold: u8,
    pub high_threshold: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSigner {
    pub key: String,
    pub weight: u32,
}

impl AccountRecord {
    pub fn sequence_number(&self) -> Result<i64> {
        self.sequence
            .parse()
            .wrap_err_with(|| format!("invalid account sequence {}", self.sequence))
    }
}

/// Read access to an account's transaction history.
#[async_trait]
pub trait TransactionFetcher: Send + Sync {
    /// Fetch one page of transactions for `account` starting after `cursor`.
    /// An empty page means the history is exhausted.
    async fn fetch_transactions(&self, account: &str, cursor: &str) -> Result<TransactionPage>;

    /// Fetch a single transaction by hash; `None` when Horizon has no record.
    async fn fetch_transaction(&self, hash: &str) -> Result<Option<TransactionRecord>>;

    /// Fetch the payment operations of a transaction.
    async fn fetch_payments(&self, tx_hash: &str) -> Result<Vec<PaymentRecord>>;
}

/// Account reads and envelope submission, used by the payment builder.
#[async_trait]
pub trait HorizonAccounts: Send + Sync {
    async fn account(&self, id: &str) -> Result<AccountRecord>;

    /// Submit a base64 transaction envelope; returns the transaction hash.
    async fn submit(&self, envelope_xdr: &str) -> std::result::Result<String, SubmitError>;
}

/// Concrete reqwest-backed client.
pub struct HorizonClient {
    base_url: String,
    http: reqwest::Client,
}

impl HorizonClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .build()
            .wrap_err("Failed to build HTTP client for Horizon")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to query {url}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .wrap_err_with(|| format!("Failed to read response body from {url}"))?;
        if !status.is_success() {
            return Err(eyre!(
                "horizon returned status {} url={} body={}",
                status,
                url,
                clip_for_log(&body, 300)
            ));
        }
        serde_json::from_str(&body).wrap_err_with(|| {
            format!("Failed to parse horizon response body={}", clip_for_log(&body, 300))
        })
    }
}

#[async_trait]
impl TransactionFetcher for HorizonClient {
    async fn fetch_transactions(&self, account: &str, cursor: &str) -> Result<TransactionPage> {
        let url = format!(
            "{}/accounts/{}/transactions?cursor={}&limit={}&include_failed=false&order=asc",
            self.base_url, account, cursor, PAGE_LIMIT
        );
        let json = self.get_json(&url).await?;
        let records = json["_embedded"]["records"].clone();
        let records: Vec<TransactionRecord> = serde_json::from_value(records)
            .wrap_err("Failed to parse transaction records")?;
        Ok(TransactionPage { records })
    }

    async fn fetch_transaction(&self, hash: &str) -> Result<Option<TransactionRecord>> {
        let url = format!("{}/transactions/{}", self.base_url, hash);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to query {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        let body = response.text().await.wrap_err("Failed to read transaction body")?;
        if !status.is_success() {
            return Err(eyre!(
                "horizon returned status {} url={} body={}",
                status,
                url,
                clip_for_log(&body, 300)
            ));
        }
        let record = serde_json::from_str(&body).wrap_err("Failed to parse transaction")?;
        Ok(Some(record))
    }

    async fn fetch_payments(&self, tx_hash: &str) -> Result<Vec<PaymentRecord>> {
        let url = format!(
            "{}/transactions/{}/payments?limit=200",
            self.base_url, tx_hash
        );
        let json = self.get_json(&url).await?;
        let records: Vec<PaymentRecord> =
            serde_json::from_value(json["_embedded"]["records"].clone())
                .wrap_err("Failed to parse payment records")?;
        Ok(records)
    }
}

#[async_trait]
impl HorizonAccounts for HorizonClient {
    async fn account(&self, id: &str) -> Result<AccountRecord> {
        let url = format!("{}/accounts/{}", self.base_url, id);
        let json = self.get_json(&url).await?;
        serde_json::from_value(json).wrap_err("Failed to parse account record")
    }

    async fn submit(&self, envelope_xdr: &str) -> std::result::Result<String, SubmitError> {
        let url = format!("{}/transactions", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[("tx", envelope_xdr)])
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        let json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| SubmitError::Rejected(clip_for_log(&body, 300)))?;

        if status.is_success() {
            return json["hash"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| SubmitError::Rejected("missing hash in response".into()));
        }

        let tx_code = json["extras"]["result_codes"]["transaction"]
            .as_str()
            .unwrap_or_default();
        if tx_code == "tx_bad_seq" {
            return Err(SubmitError::BadSequence);
        }
        Err(SubmitError::Rejected(format!(
            "{} {}",
            tx_code,
            json["extras"]["result_codes"]["operations"]
        )))
    }
}

fn clip_for_log(input: &str, max_chars: usize) -> String {
    let clipped: String = input.chars().take(max_chars).collect();
    if input.chars().count() > max_chars {
        format!("{}...(truncated)", clipped)
    } else {
        clipped
    }
}
