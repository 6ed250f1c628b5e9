//! REST collaborators on the leader: automation catalogue, rate snapshots,
//! unit labels, experiments and dataset export.

use crate::config::SyncConfig;
use crate::error::FetchError;
use crate::identity::IdentityMap;
use crate::snapshot::{RateSnapshot, UnitRates};
use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One configurable field of an automation, as the backend describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationField {
    pub key: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(rename = "type", default = "numeric")]
    pub kind: String,
}

fn numeric() -> String {
    "numeric".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationDefinition {
    #[serde(alias = "automation_name")]
    pub key: String,
    #[serde(alias = "display_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<AutomationField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `POST /query_datasets`. The selection is an experiment name or
/// `<All experiments>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    #[serde(rename = "experimentSelection")]
    pub experiment_selection: String,
    #[serde(rename = "datasetCheckbox")]
    pub dataset_checkbox: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedDataset {
    pub filename: String,
    pub url: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn dosing_automations(&self) -> Result<Vec<AutomationDefinition>, FetchError>;

    async fn recent_media_rates(&self, experiment: &str) -> Result<RateSnapshot, FetchError>;

    async fn unit_labels(&self) -> Result<IdentityMap, FetchError>;

    /// Newest first.
    async fn experiments(&self) -> Result<Vec<Experiment>, FetchError>;

    async fn export_datasets(&self, request: &ExportRequest) -> Result<ExportedDataset, FetchError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()?;
        Ok(Self::new(&cfg.api_base(), http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}{prefix}/{segment}` with `segment` percent-encoded as a single
    /// path segment, so `?`, `%`, `/` or spaces in names cannot leak into the
    /// query or add path levels.
    fn segment_url(&self, prefix: &str, segment: &str) -> Result<Url, FetchError> {
        let invalid = |reason: String| FetchError::Url {
            base: self.base_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.url(prefix)).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("base url cannot carry a path".into()))?
            .push(segment);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        debug!(path, "GET");
        let resp = self.http.get(self.url(path)).send().await?;
        read_json(path, resp).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::Body {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn dosing_automations(&self) -> Result<Vec<AutomationDefinition>, FetchError> {
        self.get_json("/contrib/automations/dosing").await
    }

    async fn recent_media_rates(&self, experiment: &str) -> Result<RateSnapshot, FetchError> {
        let url = self.segment_url("/recent_media_rates", experiment)?;
        debug!(path = url.path(), "GET");
        let resp = self.http.get(url.clone()).send().await?;
        let rows: HashMap<String, UnitRates> = read_json(url.path(), resp).await?;
        Ok(RateSnapshot::from_rows(rows))
    }

    async fn unit_labels(&self) -> Result<IdentityMap, FetchError> {
        self.get_json("/get_current_unit_labels").await
    }

    async fn experiments(&self) -> Result<Vec<Experiment>, FetchError> {
        self.get_json("/get_experiments").await
    }

    async fn export_datasets(&self, request: &ExportRequest) -> Result<ExportedDataset, FetchError> {
        let path = "/query_datasets";
        debug!(path, selection = %request.experiment_selection, "POST");
        let resp = self.http.post(self.url(path)).json(request).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        // A failed export still carries `{result, filename: null, msg}`.
        let body: ExportResponse = match serde_json::from_slice(&bytes) {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(FetchError::Status {
                    path: path.to_string(),
                    status: status.as_u16(),
                })
            }
            Err(e) => {
                return Err(FetchError::Body {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        match body.filename {
            Some(filename) if status.is_success() && !filename.is_empty() => Ok(ExportedDataset {
                url: self.url(&format!("/public/{filename}")),
                filename,
            }),
            _ => Err(FetchError::Export(
                body.msg
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("no file produced ({status})")),
            )),
        }
    }
}
