//! Spreadsheet file I/O and the remote tabular store client for Base Mae.

use std::borrow::Cow;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader, Sheets};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use basemae_core::{table_from_rows, CellValue, Table};

pub const CRATE_NAME: &str = "basemae-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A durable artifact after an atomic write, with the digest stage reports
/// carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
}

/// Writes bytes to `path` through a temp file in the same directory plus a
/// rename, so a crash mid-write never leaves a partial artifact at the
/// final path. Temp names end in `.tmp`, which the raw-input glob excludes.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<WrittenArtifact> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
    let temp_path = parent.join(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
    Ok(WrittenArtifact {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len(),
    })
}

/// One sheet of a workbook about to be written.
#[derive(Debug, Clone, Copy)]
pub struct SheetData<'a> {
    pub name: &'a str,
    pub table: &'a Table,
}

/// Renders the sheets into a workbook and stores it atomically. The header
/// row comes from each table's columns; text cells keep their text so
/// protocol and document columns never regain numeric formatting.
pub async fn write_workbook(
    path: &Path,
    sheets: &[SheetData<'_>],
) -> anyhow::Result<WrittenArtifact> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    for sheet in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet
            .set_name(sheet.name)
            .with_context(|| format!("naming sheet {}", sheet.name))?;
        for (col, name) in sheet.table.columns().iter().enumerate() {
            worksheet
                .write_string(0, col as u16, name)
                .with_context(|| format!("writing header of sheet {}", sheet.name))?;
        }
        for (row_idx, row) in sheet.table.rows().enumerate() {
            for (col, cell) in row.iter().enumerate() {
                let row_num = (row_idx + 1) as u32;
                match cell {
                    CellValue::Empty => {}
                    CellValue::Text(text) => {
                        worksheet
                            .write_string(row_num, col as u16, text)
                            .with_context(|| format!("writing sheet {}", sheet.name))?;
                    }
                    CellValue::Number(n) => {
                        worksheet
                            .write_number(row_num, col as u16, *n)
                            .with_context(|| format!("writing sheet {}", sheet.name))?;
                    }
                }
            }
        }
    }
    let buffer = workbook
        .save_to_buffer()
        .with_context(|| format!("rendering workbook {}", path.display()))?;
    write_bytes_atomic(path, &buffer).await
}

fn cell_from_sheet(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => text_cell(s),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Text(b.to_string()),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) => text_cell(s),
        Data::DurationIso(s) => text_cell(s),
        Data::Error(_) => CellValue::Empty,
    }
}

fn text_cell(s: &str) -> CellValue {
    if s.trim().is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(s.to_string())
    }
}

/// An open spreadsheet workbook (.xls, .xlsx or .ods).
pub struct WorkbookFile {
    sheets: Sheets<BufReader<File>>,
}

impl WorkbookFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let sheets = open_workbook_auto(path)
            .with_context(|| format!("opening workbook {}", path.display()))?;
        Ok(Self { sheets })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names().to_vec()
    }

    pub fn read_sheet(&mut self, name: &str, header_offset: usize) -> anyhow::Result<Table> {
        let range = self
            .sheets
            .worksheet_range(name)
            .with_context(|| format!("reading sheet {name}"))?;
        let rows = range.rows().map(|row| row.iter().map(cell_from_sheet).collect());
        Ok(table_from_rows(rows, header_offset))
    }

    pub fn read_first_sheet(&mut self, header_offset: usize) -> anyhow::Result<Table> {
        let first = self
            .sheet_names()
            .into_iter()
            .next()
            .context("workbook has no sheets")?;
        self.read_sheet(&first, header_offset)
    }
}

/// Loads one tabular file into a Table, honoring the header offset. CSV is
/// dispatched on extension; everything else goes through the workbook
/// opener and its first sheet.
pub fn read_table_file(path: &Path, header_offset: usize) -> anyhow::Result<Table> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if extension == "csv" {
        read_csv_table(path, header_offset)
    } else {
        WorkbookFile::open(path)?.read_first_sheet(header_offset)
    }
}

/// Reads a CSV export. Portals disagree on delimiters and encodings, so the
/// delimiter is sniffed from the header line (preamble lines above the
/// offset may carry no delimiter at all) and files that are not valid UTF-8
/// are decoded as cp1252.
pub fn read_csv_table(path: &Path, header_offset: usize) -> anyhow::Result<Table> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading csv file {}", path.display()))?;
    let text = decode_csv_bytes(&bytes);
    let delimiter = sniff_delimiter(&text, header_offset);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    for result in reader.records() {
        let record = result.with_context(|| format!("parsing csv file {}", path.display()))?;
        rows.push(record.iter().map(text_cell).collect());
    }
    Ok(table_from_rows(rows, header_offset))
}

/// Strict UTF-8 first; anything invalid is taken to be cp1252, the encoding
/// the older portals export in.
fn decode_csv_bytes(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded
        }
    }
}

fn sniff_delimiter(text: &str, header_offset: usize) -> u8 {
    let header_line = text
        .lines()
        .nth(header_offset)
        .or_else(|| text.lines().next())
        .unwrap_or("");
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Spreadsheet-style column letter for a zero-based index (0 -> A, 22 -> W,
/// 26 -> AA).
pub fn column_letter(index: usize) -> String {
    let mut letters: Vec<u8> = Vec::new();
    let mut value = index as i64;
    while value >= 0 {
        letters.push(b'A' + (value % 26) as u8);
        value = value / 26 - 1;
    }
    letters.reverse();
    letters.into_iter().map(char::from).collect()
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

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store configuration: {0}")]
    Config(String),
    #[error("remote request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote store returned http {status} for {url}")]
    Http { status: u16, url: String },
    #[error("remote request retries exhausted for {0}")]
    RetriesExhausted(String),
    #[error("remote store has no sheet titled {0}")]
    MissingSheet(String),
}

/// Connection settings for the shared remote spreadsheet store.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub token: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    /// Reads `SHEETS_SPREADSHEET_ID` / `SHEETS_API_TOKEN` (required) and
    /// `SHEETS_API_BASE` (optional) from the environment. Missing required
    /// values are fatal to the sync stage only; local stages never need
    /// this config.
    pub fn from_env() -> Result<Self, RemoteError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RemoteError> {
        let api_base = lookup("SHEETS_API_BASE")
            .unwrap_or_else(|| "https://sheets.googleapis.com".to_string());
        let spreadsheet_id = lookup("SHEETS_SPREADSHEET_ID")
            .ok_or_else(|| RemoteError::Config("SHEETS_SPREADSHEET_ID is not set".to_string()))?;
        let token = lookup("SHEETS_API_TOKEN")
            .ok_or_else(|| RemoteError::Config("SHEETS_API_TOKEN is not set".to_string()))?;
        Ok(Self {
            api_base,
            spreadsheet_id,
            token,
            timeout: Duration::from_secs(30),
        })
    }
}

/// The four operations the pipeline needs from the remote store, plus tab
/// enumeration. Ranges use A1 notation (`Tab!A:W`).
#[async_trait]
pub trait RemoteTable: Send + Sync {
    async fn sheet_titles(&self) -> Result<Vec<String>, RemoteError>;
    async fn get_range(&self, range: &str) -> Result<Vec<Vec<String>>, RemoteError>;
    async fn append_rows(&self, range: &str, rows: &[Vec<String>]) -> Result<usize, RemoteError>;
    async fn clear_range(&self, range: &str) -> Result<(), RemoteError>;
    async fn format_date_columns(
        &self,
        tab: &str,
        first_row: usize,
        row_count: usize,
        columns: &[usize],
        pattern: &str,
    ) -> Result<(), RemoteError>;
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
struct AppendUpdates {
    #[serde(rename = "updatedRows", default)]
    updated_rows: usize,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
    #[serde(rename = "sheetId")]
    sheet_id: i64,
}

/// HTTP client for a Sheets-style values API. Reads retry on transient
/// failures; appends do not, since a timed-out append may have landed and a
/// blind retry would double-append.
pub struct SheetsClient {
    http: reqwest::Client,
    config: RemoteConfig,
    backoff: BackoffPolicy,
}

impl SheetsClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn values_url(&self, range: &str, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}{}",
            self.config.api_base, self.config.spreadsheet_id, range, suffix
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, RemoteError> {
        let mut last_error: Option<RemoteError> = None;
        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .http
                .get(&url)
                .bearer_auth(&self.config.token)
                .send()
                .await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<T>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, status = status.as_u16(), attempt, "retrying remote read");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Http {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(RemoteError::Request(err));
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Request(err));
                }
            }
        }
        Err(last_error.unwrap_or(RemoteError::RetriesExhausted(url)))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, RemoteError> {
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn spreadsheet_meta(&self) -> Result<SpreadsheetMeta, RemoteError> {
        let url = format!(
            "{}/v4/spreadsheets/{}?fields=sheets.properties",
            self.config.api_base, self.config.spreadsheet_id
        );
        self.get_json(url).await
    }

    async fn sheet_id_for_title(&self, title: &str) -> Result<i64, RemoteError> {
        let meta = self.spreadsheet_meta().await?;
        meta.sheets
            .into_iter()
            .find(|sheet| sheet.properties.title == title)
            .map(|sheet| sheet.properties.sheet_id)
            .ok_or_else(|| RemoteError::MissingSheet(title.to_string()))
    }
}

#[async_trait]
impl RemoteTable for SheetsClient {
    async fn sheet_titles(&self) -> Result<Vec<String>, RemoteError> {
        let meta = self.spreadsheet_meta().await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|sheet| sheet.properties.title)
            .collect())
    }

    async fn get_range(&self, range: &str) -> Result<Vec<Vec<String>>, RemoteError> {
        let url = self.values_url(range, "");
        let resp: ValuesResponse = self.get_json(url).await?;
        Ok(resp.values)
    }

    async fn append_rows(&self, range: &str, rows: &[Vec<String>]) -> Result<usize, RemoteError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let url = self.values_url(
            range,
            ":append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
        );
        let body = json!({ "values": rows });
        let resp: AppendResponse = self.post_json(url, body).await?;
        Ok(resp
            .updates
            .map(|updates| updates.updated_rows)
            .unwrap_or(rows.len()))
    }

    async fn clear_range(&self, range: &str) -> Result<(), RemoteError> {
        let url = self.values_url(range, ":clear");
        let _: serde_json::Value = self.post_json(url, json!({})).await?;
        Ok(())
    }

    async fn format_date_columns(
        &self,
        tab: &str,
        first_row: usize,
        row_count: usize,
        columns: &[usize],
        pattern: &str,
    ) -> Result<(), RemoteError> {
        if row_count == 0 || columns.is_empty() {
            return Ok(());
        }
        let sheet_id = self.sheet_id_for_title(tab).await?;
        let requests: Vec<serde_json::Value> = columns
            .iter()
            .map(|col| {
                json!({
                    "repeatCell": {
                        "range": {
                            "sheetId": sheet_id,
                            "startRowIndex": first_row,
                            "endRowIndex": first_row + row_count,
                            "startColumnIndex": col,
                            "endColumnIndex": col + 1,
                        },
                        "cell": {
                            "userEnteredFormat": {
                                "numberFormat": { "type": "DATE", "pattern": pattern }
                            }
                        },
                        "fields": "userEnteredFormat.numberFormat",
                    }
                })
            })
            .collect();
        let url = format!(
            "{}/v4/spreadsheets/{}:batchUpdate",
            self.config.api_base, self.config.spreadsheet_id
        );
        let _: serde_json::Value = self.post_json(url, json!({ "requests": requests })).await?;
        Ok(())
    }
}
