use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::apis::SurveillanceSource;
use crate::app::ports::{HttpClientPort, HttpGetResult};
use crate::config::SourceConfig;
use crate::constants::{FLUVIEW_SOURCE_NAME, PROVIDER_RESULT_NO_RESULTS, PROVIDER_RESULT_SUCCESS};
use crate::error::{FetchError, FetchErrorKind};
use crate::infra::http_client::ReqwestHttp;
use crate::observability::metrics::sources;
use crate::types::{RawRow, Region, WeekRange};

/// Response envelope of the Delphi Epidata fluview endpoint.
#[derive(Debug, Deserialize)]
struct FluviewResponse {
    result: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    epidata: Option<Vec<RawRow>>,
}

/// Source client for CDC ILINet data served by Delphi Epidata.
pub struct FluviewClient {
    http: Arc<dyn HttpClientPort>,
    config: SourceConfig,
}

impl FluviewClient {
    pub fn new(http: Arc<dyn HttpClientPort>, config: SourceConfig) -> Self {
        Self { http, config }
    }

    pub fn with_reqwest(config: SourceConfig) -> Self {
        Self::new(Arc::new(ReqwestHttp::new()), config)
    }

    fn query(region: Region, range: WeekRange) -> Vec<(&'static str, String)> {
        vec![("regions", region.code().to_string()), ("epiweeks", range.to_string())]
    }

    /// One network attempt bounded by the configured timeout.
    async fn attempt(&self, query: &[(&str, String)]) -> Result<HttpGetResult, String> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.http.get(&self.config.base_url, query)).await {
            Ok(result) => result,
            Err(_) => Err(format!("request timed out after {}s", timeout.as_secs())),
        }
    }

    /// Decode a successful response body. Failures here are never retried.
    /// Only the envelope is checked; rows are typed later, one by one.
    pub fn parse_body(bytes: &[u8]) -> Result<Vec<RawRow>, FetchErrorKind> {
        let response: FluviewResponse =
            serde_json::from_slice(bytes).map_err(|e| FetchErrorKind::Malformed(e.to_string()))?;

        match response.result {
            PROVIDER_RESULT_SUCCESS => response
                .epidata
                .ok_or_else(|| FetchErrorKind::Malformed("success result without epidata".to_string())),
            PROVIDER_RESULT_NO_RESULTS => Ok(Vec::new()),
            code => Err(FetchErrorKind::Provider {
                code,
                message: response.message.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl SurveillanceSource for FluviewClient {
    fn source_name(&self) -> &'static str {
        FLUVIEW_SOURCE_NAME
    }

    #[instrument(skip_all, fields(region = region.code(), epiweeks = %range))]
    async fn fetch(&self, region: Region, range: WeekRange) -> Result<Vec<RawRow>, FetchError> {
        let query = Self::query(region, range);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            sources::request_attempt(region.code());
            let started = Instant::now();

            match self.attempt(&query).await {
                Ok(resp) if resp.is_success() => {
                    sources::request_duration(started.elapsed().as_secs_f64());
                    let records = Self::parse_body(&resp.bytes).map_err(|kind| {
                        warn!(content_type = %resp.content_type, "Unusable fluview response: {}", kind);
                        sources::request_error(region.code(), "body");
                        FetchError::new(region, kind)
                    })?;
                    info!("Fetched {} rows on attempt {}", records.len(), attempt);
                    return Ok(records);
                }
                Ok(resp) => last_error = format!("HTTP status {}", resp.status),
                Err(e) => last_error = e,
            }

            sources::request_error(region.code(), "transient");
            warn!("Attempt {}/{} failed: {}", attempt, max_attempts, last_error);
            if attempt < max_attempts {
                debug!("Retrying in {:?}", self.config.retry_delay());
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        Err(FetchError::new(
            region,
            FetchErrorKind::RetriesExhausted {
                attempts: max_attempts,
                last_error,
            },
        ))
    }
}
