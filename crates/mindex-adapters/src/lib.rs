//! Collaborator boundaries: the reference-source client and the external
//! dataset reader. Untyped payloads are validated and converted into the
//! core structs exactly once, here.

use async_trait::async_trait;
use chrono::Utc;
use mindex_core::{ExternalRecord, PolytypeRef, ReferenceRecord};
use mindex_storage::{
    classify_status, FetchError, FetchedResponse, HttpFetcher, RetryDisposition, Url,
};
use scraper::Html;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "mindex-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    /// Request-level failure a later pass may succeed at. Recorded per
    /// item; never aborts the batch.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The source itself is unreachable or rejects us outright. Fatal for
    /// the whole operation.
    #[error("reference source unreachable: {0}")]
    Connection(String),
    /// The source answered with a payload we cannot convert.
    #[error("malformed reference payload: {0}")]
    Validation(String),
}

/// Client contract for the authoritative mineral database.
///
/// `Ok(None)` from `fetch_by_id` is the not-found signal that drives
/// deletion detection; it is deliberately not an error.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>, SourceError>;
    async fn search_by_name(
        &self,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ReferenceRecord>, SourceError>;
}

/// Wire shape of one reference-source record. Field names follow the
/// upstream API; `0` in the relationship columns means "no parent".
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceRecordDto {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub formula_plain: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub strunz1: Option<String>,
    #[serde(default)]
    pub strunz2: Option<String>,
    #[serde(default)]
    pub strunz3: Option<String>,
    #[serde(default)]
    pub strunz4: Option<String>,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub lustre: Option<String>,
    #[serde(default)]
    pub streak: Option<String>,
    #[serde(default)]
    pub csystem: Option<String>,
    #[serde(default)]
    pub hardness: Option<String>,
    #[serde(default)]
    pub varietyof: Option<i64>,
    #[serde(default)]
    pub groupid: Option<i64>,
    #[serde(default)]
    pub synid: Option<i64>,
    #[serde(default)]
    pub polytypeof: Option<PolytypeRef>,
}

fn nonzero(id: Option<i64>) -> Option<i64> {
    id.filter(|v| *v != 0)
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ReferenceRecordDto {
    /// Validates and converts the wire record, computing the content hash
    /// and stamping the sync time.
    pub fn into_record(self) -> Result<ReferenceRecord, SourceError> {
        if self.id <= 0 {
            return Err(SourceError::Validation(format!(
                "non-positive reference id {}",
                self.id
            )));
        }
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SourceError::Validation(format!(
                "reference record {} has an empty name",
                self.id
            )));
        }

        let polytype_of = match self.polytypeof {
            Some(PolytypeRef::Id(0)) => None,
            Some(PolytypeRef::Text(text)) if text.trim().is_empty() => None,
            other => other,
        };

        let mut record = ReferenceRecord {
            reference_id: self.id,
            canonical_name: name.to_string(),
            formula: blank_to_none(self.formula),
            formula_plain: blank_to_none(self.formula_plain),
            classification_parts: [
                blank_to_none(self.strunz1),
                blank_to_none(self.strunz2),
                blank_to_none(self.strunz3),
                blank_to_none(self.strunz4),
            ],
            status: blank_to_none(self.status).unwrap_or_else(|| "unknown".to_string()),
            color: blank_to_none(self.colour),
            luster: blank_to_none(self.lustre),
            streak: blank_to_none(self.streak),
            crystal_system: blank_to_none(self.csystem),
            hardness: blank_to_none(self.hardness),
            variety_of: nonzero(self.varietyof),
            group_id: nonzero(self.groupid),
            synonym_of: nonzero(self.synid),
            polytype_of,
            content_hash: String::new(),
            last_synced_at: Utc::now(),
        };
        record.refresh_content_hash();
        Ok(record)
    }
}

#[derive(Debug, Deserialize)]
struct SearchPageDto {
    #[serde(default)]
    results: Vec<ReferenceRecordDto>,
}

/// HTTP/JSON client for the reference source, built on the storage
/// fetcher. Issues one attempt per call; pacing and retries belong to the
/// sync engine.
pub struct HttpReferenceSource {
    base_url: String,
    fetcher: HttpFetcher,
}

impl HttpReferenceSource {
    pub fn new(base_url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, fetcher }
    }

    fn record_url(&self, id: i64) -> String {
        format!("{}/minerals/{id}", self.base_url)
    }

    fn search_url(&self, query: &str, page: usize, page_size: usize) -> Result<String, SourceError> {
        let url = Url::parse_with_params(
            &format!("{}/minerals", self.base_url),
            [
                ("name", query.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ],
        )
        .map_err(|e| SourceError::Validation(format!("bad search url: {e}")))?;
        Ok(url.into())
    }
}

fn map_fetch_error(err: FetchError) -> SourceError {
    match err {
        FetchError::Transient { url, reason } => {
            SourceError::Transient(format!("{reason} ({url})"))
        }
        FetchError::Connection { url, reason } => {
            SourceError::Connection(format!("{reason} ({url})"))
        }
    }
}

/// Interprets a record-by-id response: 404 is the deletion signal,
/// retryable statuses are transient, anything else unexpected is treated
/// as a source-level rejection.
pub fn decode_record_response(
    resp: &FetchedResponse,
) -> Result<Option<ReferenceRecord>, SourceError> {
    if resp.status.as_u16() == 404 {
        return Ok(None);
    }
    if resp.status.is_success() {
        let dto: ReferenceRecordDto = serde_json::from_slice(&resp.body)
            .map_err(|e| SourceError::Validation(format!("{e} ({})", resp.final_url)))?;
        return dto.into_record().map(Some);
    }
    match classify_status(resp.status) {
        RetryDisposition::Retryable => Err(SourceError::Transient(format!(
            "http status {} for {}",
            resp.status, resp.final_url
        ))),
        RetryDisposition::NonRetryable => Err(SourceError::Connection(format!(
            "http status {} for {}",
            resp.status, resp.final_url
        ))),
    }
}

#[async_trait]
impl ReferenceSource for HttpReferenceSource {
    async fn fetch_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>, SourceError> {
        let url = self.record_url(id);
        let resp = self.fetcher.fetch(&url).await.map_err(map_fetch_error)?;
        decode_record_response(&resp)
    }

    async fn search_by_name(
        &self,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ReferenceRecord>, SourceError> {
        let url = self.search_url(query, page, page_size)?;
        let resp = self.fetcher.fetch(&url).await.map_err(map_fetch_error)?;
        if !resp.status.is_success() {
            return match classify_status(resp.status) {
                RetryDisposition::Retryable => Err(SourceError::Transient(format!(
                    "http status {} for {}",
                    resp.status, resp.final_url
                ))),
                RetryDisposition::NonRetryable => Err(SourceError::Connection(format!(
                    "http status {} for {}",
                    resp.status, resp.final_url
                ))),
            };
        }
        let page: SearchPageDto = serde_json::from_slice(&resp.body)
            .map_err(|e| SourceError::Validation(format!("{e} ({})", resp.final_url)))?;
        let mut records = Vec::with_capacity(page.results.len());
        for dto in page.results {
            match dto.into_record() {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "skipping malformed search result"),
            }
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// External dataset reader
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot parse dataset: {0}")]
    Parse(String),
    #[error("cannot read dataset file: {0}")]
    Io(String),
}

/// Wire shape of one exported spreadsheet row. Everything is optional
/// except the title; missing columns deserialize to defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalRecordDto {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub classification_parts: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub luster: Option<String>,
    #[serde(default)]
    pub streak: Option<String>,
    #[serde(default)]
    pub crystal_system: Option<String>,
    #[serde(default)]
    pub hardness: Option<String>,
    #[serde(default)]
    pub variety_of_name: Option<String>,
    #[serde(default)]
    pub synonym_of_name: Option<String>,
}

/// Drops markup tags and decodes HTML entities from an exported cell.
/// The export double-encodes formulas (`CaCO<sub>3</sub>`, `&middot;`).
pub fn strip_markup(raw: &str) -> String {
    if !raw.contains('<') && !raw.contains('&') {
        return raw.to_string();
    }
    let fragment = Html::parse_fragment(raw);
    fragment.root_element().text().collect::<String>()
}

impl ExternalRecordDto {
    pub fn into_record(self) -> Result<ExternalRecord, SourceError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(SourceError::Validation("row has an empty title".into()));
        }
        let mut classification_parts: Vec<String> = self
            .classification_parts
            .into_iter()
            .map(|p| p.trim().to_string())
            .collect();
        classification_parts.truncate(4);

        Ok(ExternalRecord {
            title: title.to_string(),
            reference_id: blank_to_none(self.reference_id),
            formula: blank_to_none(self.formula.map(|f| strip_markup(&f))),
            classification_parts,
            color: blank_to_none(self.color),
            luster: blank_to_none(self.luster),
            streak: blank_to_none(self.streak),
            crystal_system: blank_to_none(self.crystal_system),
            hardness: blank_to_none(self.hardness),
            variety_of_name: blank_to_none(self.variety_of_name),
            synonym_of_name: blank_to_none(self.synonym_of_name),
        })
    }
}

/// Result of loading an export: valid rows plus the reasons rows were
/// skipped. Skips never abort the load.
#[derive(Debug, Default)]
pub struct DatasetLoad {
    pub records: Vec<ExternalRecord>,
    pub skipped: Vec<String>,
}

/// Parses a JSON-array export into typed external records, skipping and
/// logging malformed rows.
pub fn parse_dataset(json: &str) -> Result<DatasetLoad, DatasetError> {
    let rows: Vec<ExternalRecordDto> =
        serde_json::from_str(json).map_err(|e| DatasetError::Parse(e.to_string()))?;

    let mut load = DatasetLoad::default();
    for (index, row) in rows.into_iter().enumerate() {
        match row.into_record() {
            Ok(record) => load.records.push(record),
            Err(err) => {
                warn!(row = index, error = %err, "skipping malformed dataset row");
                load.skipped.push(format!("row {index}: {err}"));
            }
        }
    }
    Ok(load)
}

pub fn load_dataset(path: impl AsRef<std::path::Path>) -> Result<DatasetLoad, DatasetError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| DatasetError::Io(format!("{e} ({})", path.display())))?;
    parse_dataset(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindex_storage::StatusCode;

    #[test]
    fn dto_conversion_validates_and_hashes() {
        let dto = ReferenceRecordDto {
            id: 472236,
            name: " Huanghoite-(Nd) ".to_string(),
            formula: Some("BaNd(CO3)2F".to_string()),
            formula_plain: None,
            status: None,
            strunz1: Some("5".to_string()),
            strunz2: Some("A".to_string()),
            strunz3: Some("B".to_string()),
            strunz4: Some("35".to_string()),
            colour: None,
            lustre: None,
            streak: None,
            csystem: None,
            hardness: None,
            varietyof: Some(0),
            groupid: Some(29229),
            synid: None,
            polytypeof: None,
        };
        let record = dto.into_record().unwrap();
        assert_eq!(record.canonical_name, "Huanghoite-(Nd)");
        assert_eq!(record.status, "unknown");
        assert_eq!(record.variety_of, None);
        assert_eq!(record.group_id, Some(29229));
        assert_eq!(record.content_hash, record.compute_content_hash());
    }

    #[test]
    fn dto_conversion_rejects_bad_rows() {
        let nameless = ReferenceRecordDto {
            id: 5,
            name: "   ".to_string(),
            formula: None,
            formula_plain: None,
            status: None,
            strunz1: None,
            strunz2: None,
            strunz3: None,
            strunz4: None,
            colour: None,
            lustre: None,
            streak: None,
            csystem: None,
            hardness: None,
            varietyof: None,
            groupid: None,
            synid: None,
            polytypeof: None,
        };
        assert!(matches!(
            nameless.into_record(),
            Err(SourceError::Validation(_))
        ));
    }

    #[test]
    fn polytype_parses_both_id_and_text() {
        let json = r#"{"id": 9, "name": "Graphite-2H", "polytypeof": 1740}"#;
        let dto: ReferenceRecordDto = serde_json::from_str(json).unwrap();
        assert_eq!(
            dto.into_record().unwrap().polytype_of,
            Some(PolytypeRef::Id(1740))
        );

        let json = r#"{"id": 9, "name": "Graphite-2H", "polytypeof": "Graphite"}"#;
        let dto: ReferenceRecordDto = serde_json::from_str(json).unwrap();
        assert_eq!(
            dto.into_record().unwrap().polytype_of,
            Some(PolytypeRef::Text("Graphite".to_string()))
        );
    }

    #[test]
    fn record_response_maps_status_taxonomy() {
        let not_found = FetchedResponse {
            status: StatusCode::NOT_FOUND,
            final_url: "http://source/minerals/1".to_string(),
            body: Vec::new(),
        };
        assert!(matches!(decode_record_response(&not_found), Ok(None)));

        let throttled = FetchedResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            final_url: "http://source/minerals/1".to_string(),
            body: Vec::new(),
        };
        assert!(matches!(
            decode_record_response(&throttled),
            Err(SourceError::Transient(_))
        ));

        let rejected = FetchedResponse {
            status: StatusCode::UNAUTHORIZED,
            final_url: "http://source/minerals/1".to_string(),
            body: Vec::new(),
        };
        assert!(matches!(
            decode_record_response(&rejected),
            Err(SourceError::Connection(_))
        ));

        let garbled = FetchedResponse {
            status: StatusCode::OK,
            final_url: "http://source/minerals/1".to_string(),
            body: b"not json".to_vec(),
        };
        assert!(matches!(
            decode_record_response(&garbled),
            Err(SourceError::Validation(_))
        ));
    }

    #[test]
    fn markup_stripping_unescapes_formulas() {
        assert_eq!(strip_markup("CaCO<sub>3</sub>"), "CaCO3");
        assert_eq!(strip_markup("CaSO4&middot;2H2O"), "CaSO4·2H2O");
        assert_eq!(strip_markup("SiO2"), "SiO2");
    }

    #[test]
    fn dataset_parse_skips_malformed_rows() {
        let json = r#"[
            {"title": "Quartz", "reference_id": "3337", "formula": "SiO<sub>2</sub>"},
            {"title": "   "},
            {"title": "Amethyst", "variety_of_name": "Quartz"}
        ]"#;
        let load = parse_dataset(json).unwrap();
        assert_eq!(load.records.len(), 2);
        assert_eq!(load.skipped.len(), 1);
        assert_eq!(load.records[0].formula.as_deref(), Some("SiO2"));
        assert_eq!(
            load.records[1].variety_of_name.as_deref(),
            Some("Quartz")
        );
    }

    #[test]
    fn url_building_escapes_queries() {
        let source = HttpReferenceSource::new(
            "http://source/api/",
            HttpFetcher::new(Default::default()).unwrap(),
        );
        assert_eq!(source.record_url(42), "http://source/api/minerals/42");
        assert_eq!(
            source.search_url("Huanghoite-(Nd)", 1, 50).unwrap(),
            "http://source/api/minerals?name=Huanghoite-%28Nd%29&page=1&page_size=50"
        );
    }
}
