//! Feature-level operations on the analysis service. Each one is a thin
//! parameterization of [`RequestClient::request`].

use std::sync::Arc;
use std::time::Duration;

use brand_audit_protocol::AnalyzeRequest;
use brand_audit_protocol::AnalyzeResponse;
use brand_audit_protocol::HealthResponse;
use brand_audit_protocol::StatusResponse;
use serde_json::Value;

use crate::client::Endpoint;
use crate::client::RequestClient;
use crate::client::RequestOptions;
use crate::error::ApiError;
use crate::error::ErrorKind;
use crate::error::Result;

pub const ANALYZE_ROUTE: &str = "/analyze";
pub const STATUS_ROUTE: &str = "/analyze/{id}/status";
pub const RESULTS_ROUTE: &str = "/analyze/{id}/results";
pub const HEALTH_ROUTE: &str = "/health";

#[derive(Debug, Clone)]
pub struct AnalysisApi {
    client: Arc<RequestClient>,
}

impl AnalysisApi {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    /// `POST /analyze`. Returns the new job's id.
    pub async fn start_analysis(&self, company_name: &str) -> Result<AnalyzeResponse> {
        let endpoint = Endpoint::post(ANALYZE_ROUTE);
        let company_name = company_name.trim();
        if company_name.is_empty() {
            return Err(ApiError::new(ErrorKind::InvalidRequest, endpoint.to_string())
                .with_message("Company name must not be empty"));
        }

        let body = serde_json::to_value(AnalyzeRequest {
            company_name: company_name.to_string(),
        })
        .map_err(|e| {
            ApiError::new(ErrorKind::InvalidRequest, endpoint.to_string())
                .with_message(format!("Could not encode request body: {e}"))
        })?;

        let response: AnalyzeResponse = self
            .client
            .request(&endpoint, RequestOptions::json(body))
            .await?;
        tracing::info!(job_id = %response.analysis_id, company_name, "analysis started");
        Ok(response)
    }

    /// `GET /analyze/{id}/status`, the polling fallback.
    pub async fn status(&self, analysis_id: &str) -> Result<StatusResponse> {
        let endpoint = job_endpoint(analysis_id, "status", STATUS_ROUTE)?;
        self.client
            .request(&endpoint, RequestOptions::default())
            .await
    }

    /// `GET /analyze/{id}/results`. Only meaningful once the job is terminal.
    pub async fn results(&self, analysis_id: &str) -> Result<Value> {
        let endpoint = job_endpoint(analysis_id, "results", RESULTS_ROUTE)?;
        self.client
            .request(&endpoint, RequestOptions::default())
            .await
    }

    /// `GET /health`. Diagnostics only, so a single attempt.
    pub async fn health(&self) -> Result<HealthResponse> {
        self.client
            .request(
                &Endpoint::get(HEALTH_ROUTE),
                RequestOptions::default().max_attempts(1),
            )
            .await
    }

    pub async fn wait_for_completion(
        &self,
        analysis_id: &str,
        interval: Duration,
    ) -> Result<StatusResponse> {
        self.wait_for_completion_with(analysis_id, interval, |_| {})
            .await
    }

    /// Polls the status endpoint every `interval` until the job is terminal,
    /// handing each response to `on_status`. An open circuit is waited out
    /// rather than surfaced.
    pub async fn wait_for_completion_with<F>(
        &self,
        analysis_id: &str,
        interval: Duration,
        mut on_status: F,
    ) -> Result<StatusResponse>
    where
        F: FnMut(&StatusResponse),
    {
        loop {
            match self.status(analysis_id).await {
                Ok(status) => {
                    on_status(&status);
                    if status.status.is_terminal() {
                        return Ok(status);
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(ApiError {
                    kind: ErrorKind::CircuitOpen { retry_after },
                    ..
                }) => {
                    tracing::debug!(
                        job_id = analysis_id,
                        wait_ms = retry_after.as_millis() as u64,
                        "status circuit open, waiting"
                    );
                    tokio::time::sleep(retry_after.max(interval)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn job_endpoint(analysis_id: &str, action: &str, route: &str) -> Result<Endpoint> {
    let analysis_id = analysis_id.trim();
    if analysis_id.is_empty() {
        return Err(ApiError::new(ErrorKind::InvalidRequest, format!("GET {route}"))
            .with_message("Analysis id must not be empty"));
    }
    let path = format!("/analyze/{}/{action}", urlencoding::encode(analysis_id));
    Ok(Endpoint::get(path).with_route(route))
}
