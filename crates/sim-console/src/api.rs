//! Remote simulation service: the `SimulationApi` seam and its HTTP client.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::run::RunStatus;
use crate::validation::ValidationError;

/// Opaque identifier; the service may send either a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(pub String);

impl Ident {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Ident {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for Ident {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for Ident {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }
        Ok(match Repr::deserialize(d)? {
            Repr::Text(s) => Ident(s),
            Repr::Number(n) => Ident(n.to_string()),
        })
    }
}

pub type RunId = Ident;
pub type GenerationId = Ident;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started(RunId),
    /// The service refused the configuration (HTTP 400).
    Invalid,
    Failed(String),
}

/// Everything the core needs from the simulation service.
pub trait SimulationApi: Send + Sync {
    fn default_config(&self) -> Result<Value>;
    fn form_schema(&self) -> Result<Value>;
    fn list_configs(&self) -> Result<Vec<String>>;
    fn get_config(&self, name: &str) -> Result<Value>;
    fn save_config(&self, name: &str, config: &Value) -> Result<()>;
    /// Empty on success; the service's field errors on a 400.
    fn validate(&self, config: &Value) -> Result<Vec<ValidationError>>;
    fn start_run(&self, config: Option<&Value>) -> Result<SubmitOutcome>;
    fn run_status(&self, id: &RunId) -> Result<RunStatus>;
    fn list_generations(&self, id: &RunId) -> Result<Vec<GenerationId>>;
    fn get_generation(&self, id: &RunId, gid: &GenerationId) -> Result<Generation>;
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    base: String,
    client: Client,
}

#[derive(Deserialize)]
struct StartedBody {
    id: Ident,
}

#[derive(Deserialize)]
struct StatusBody {
    status: RunStatus,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn get_ok(&self, path: &str, what: &str) -> Result<Response> {
        let url = self.url(path);
        debug!(%url, "GET");
        let res = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::context(format!("failed to get {what}"), e))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "failed to get {what} (status {})",
                res.status()
            )));
        }
        Ok(res)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        self.get_ok(path, what)?
            .json::<T>()
            .map_err(|e| Error::context(format!("failed to get {what}"), e))
    }
}

impl SimulationApi for HttpApi {
    fn default_config(&self) -> Result<Value> {
        self.get_json("configs/default", "default configuration")
    }

    fn form_schema(&self) -> Result<Value> {
        self.get_json("configs/form", "config form")
    }

    fn list_configs(&self) -> Result<Vec<String>> {
        self.get_json("configs", "list of configs")
    }

    fn get_config(&self, name: &str) -> Result<Value> {
        self.get_json(&format!("configs/{name}"), &format!("config {name}"))
    }

    fn save_config(&self, name: &str, config: &Value) -> Result<()> {
        let url = self.url(&format!("configs/{name}"));
        debug!(%url, "PUT");
        let res = self
            .client
            .put(&url)
            .json(config)
            .send()
            .map_err(|e| Error::context(format!("failed to save config {name}"), e))?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "failed to save config {name} (status {})",
            res.status()
        )))
    }

    fn validate(&self, config: &Value) -> Result<Vec<ValidationError>> {
        let url = self.url("configs/validate");
        debug!(%url, "POST");
        let res = self
            .client
            .post(&url)
            .json(config)
            .send()
            .map_err(|e| Error::context("failed to validate config", e))?;
        match res.status() {
            s if s.is_success() => Ok(Vec::new()),
            StatusCode::BAD_REQUEST => res
                .json::<Vec<ValidationError>>()
                .map_err(|e| Error::context("failed to validate config", e)),
            s => Err(Error::msg(format!(
                "failed to validate config (status {s})"
            ))),
        }
    }

    fn start_run(&self, config: Option<&Value>) -> Result<SubmitOutcome> {
        let url = self.url("simulations");
        debug!(%url, with_body = config.is_some(), "POST");
        let mut req = self.client.post(&url);
        if let Some(cfg) = config {
            req = req.json(cfg);
        }
        let res = req
            .send()
            .map_err(|e| Error::context("failed to run simulation", e))?;
        let status = res.status();
        if status == StatusCode::BAD_REQUEST {
            return Ok(SubmitOutcome::Invalid);
        }
        if !status.is_success() {
            warn!(%status, "run submission refused");
            return Ok(SubmitOutcome::Failed(format!(
                "failed to run simulation (status {status})"
            )));
        }
        match res.json::<StartedBody>() {
            Ok(body) => Ok(SubmitOutcome::Started(body.id)),
            Err(e) => Ok(SubmitOutcome::Failed(format!(
                "failed to run simulation: malformed response: {e}"
            ))),
        }
    }

    fn run_status(&self, id: &RunId) -> Result<RunStatus> {
        let body: StatusBody =
            self.get_json(&format!("simulations/{id}/status"), "simulation state")?;
        Ok(body.status)
    }

    fn list_generations(&self, id: &RunId) -> Result<Vec<GenerationId>> {
        self.get_json(&format!("simulations/{id}/generations"), "list of generations")
    }

    fn get_generation(&self, id: &RunId, gid: &GenerationId) -> Result<Generation> {
        self.get_json(
            &format!("simulations/{id}/generations/{gid}"),
            &format!("generation {gid}"),
        )
    }
}
