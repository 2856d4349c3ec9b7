use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::AppError;

/// Result of a request to an external service.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch<T> {
    Found(T),
    NotFound,
    Transient(String),
}

impl<T> Fetch<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Fetch::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Read-only JSON access to registries and catalogs.
pub trait HttpClient: Send + Sync {
    fn get_json(&self, url: &str) -> Fetch<Value>;
}

pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("modcrane/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get_json(&self, url: &str) -> Fetch<Value> {
        debug!(url, "GET");
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(err) => return Fetch::Transient(err.to_string()),
        };
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Fetch::NotFound;
        }
        if !status.is_success() {
            return Fetch::Transient(format!("{url} returned {status}"));
        }
        match response.json::<Value>() {
            Ok(value) => Fetch::Found(value),
            Err(err) => Fetch::Transient(format!("{url} returned malformed JSON: {err}")),
        }
    }
}
