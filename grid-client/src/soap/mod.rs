//! SOAP transport for `GridServerRpc`
//!
//! Each operation is one HTTP POST to the Grid Server endpoint carrying a
//! SOAP 1.1 envelope. Requests go through an `HttpClient`, so logging, retries
//! and breakers configured on the client apply to every call.

pub mod envelope;

use async_trait::async_trait;
use grid_core::domain::lua::{GridServerStatus, JobRecord, LuaValue, ScriptExecution};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::http::{HttpClient, HttpRequest};
use crate::rpc::GridServerRpc;
use envelope::{job_element, script_element, text_element};

/// Grid Server client speaking SOAP over HTTP
#[derive(Clone)]
pub struct SoapClient {
    endpoint: String,
    http: HttpClient,
    timeout: Duration,
}

impl SoapClient {
    /// Create a new SOAP client
    ///
    /// # Arguments
    /// * `endpoint` - Service URL (e.g., "http://127.0.0.1:45000")
    /// * `http` - Client whose plan carries the requests
    /// * `timeout` - Per-call timeout
    pub fn new(endpoint: impl Into<String>, http: HttpClient, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
            timeout,
        }
    }

    /// Client for a Grid Server listening on the loopback interface
    pub fn for_port(port: u16, http: HttpClient, timeout: Duration) -> Self {
        Self::new(format!("http://127.0.0.1:{}", port), http, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one operation and returns the raw response body
    async fn invoke(&self, operation: &str, parameters: String) -> Result<String> {
        let request = HttpRequest::post(&self.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", envelope::soap_action(operation))
            .body(envelope::envelope(operation, &parameters))
            .timeout(self.timeout);

        let response = self.http.send(request).await?;

        if !response.is_success() {
            if let Some(fault) = envelope::read_fault(&response.body) {
                return Err(fault);
            }
            return Err(ClientError::api_error(response.status, response.body));
        }

        Ok(response.body)
    }
}

#[async_trait]
impl GridServerRpc for SoapClient {
    async fn hello_world(&self) -> Result<String> {
        let body = self.invoke("HelloWorld", String::new()).await?;
        Ok(envelope::read_text(&body, "HelloWorld")?.unwrap_or_default())
    }

    async fn get_version(&self) -> Result<String> {
        let body = self.invoke("GetVersion", String::new()).await?;
        Ok(envelope::read_text(&body, "GetVersion")?.unwrap_or_default())
    }

    async fn get_status(&self) -> Result<GridServerStatus> {
        let body = self.invoke("GetStatus", String::new()).await?;
        envelope::read_status(&body, "GetStatus")
    }

    async fn open_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let parameters = format!("{}{}", job_element(job), script_element(script));
        let body = self.invoke("OpenJobEx", parameters).await?;
        envelope::read_lua_values(&body, "OpenJobEx")
    }

    async fn renew_lease(&self, job_id: &str, expiration_in_seconds: f64) -> Result<f64> {
        let parameters = format!(
            "{}{}",
            text_element("jobID", job_id),
            text_element("expirationInSeconds", &expiration_in_seconds.to_string())
        );
        let body = self.invoke("RenewLease", parameters).await?;
        envelope::read_f64(&body, "RenewLease")
    }

    async fn execute(&self, job_id: &str, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let parameters = format!("{}{}", text_element("jobID", job_id), script_element(script));
        let body = self.invoke("ExecuteEx", parameters).await?;
        envelope::read_lua_values(&body, "ExecuteEx")
    }

    async fn close_job(&self, job_id: &str) -> Result<()> {
        let body = self.invoke("CloseJob", text_element("jobID", job_id)).await?;
        envelope::read_empty(&body, "CloseJob")
    }

    async fn batch_job(&self, job: &JobRecord, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let parameters = format!("{}{}", job_element(job), script_element(script));
        let body = self.invoke("BatchJobEx", parameters).await?;
        envelope::read_lua_values(&body, "BatchJobEx")
    }

    async fn get_expiration(&self, job_id: &str) -> Result<f64> {
        let body = self
            .invoke("GetExpiration", text_element("jobID", job_id))
            .await?;
        envelope::read_f64(&body, "GetExpiration")
    }

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>> {
        let body = self.invoke("GetAllJobsEx", String::new()).await?;
        envelope::read_jobs(&body, "GetAllJobsEx")
    }

    async fn close_expired_jobs(&self) -> Result<i32> {
        let body = self.invoke("CloseExpiredJobs", String::new()).await?;
        envelope::read_i32(&body, "CloseExpiredJobs")
    }

    async fn close_all_jobs(&self) -> Result<i32> {
        let body = self.invoke("CloseAllJobs", String::new()).await?;
        envelope::read_i32(&body, "CloseAllJobs")
    }

    async fn diag(&self, diag_type: i32, job_id: &str) -> Result<Vec<LuaValue>> {
        let parameters = format!(
            "{}{}",
            text_element("type", &diag_type.to_string()),
            text_element("jobID", job_id)
        );
        let body = self.invoke("DiagEx", parameters).await?;
        envelope::read_lua_values(&body, "DiagEx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_core::dto::command::GridCommand;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn wrap(operation: &str, result: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ns1="http://roblox.com/"><SOAP-ENV:Body><ns1:{op}Response>{}</ns1:{op}Response></SOAP-ENV:Body></SOAP-ENV:Envelope>"#,
            result,
            op = operation
        )
    }

    fn client(server: &MockServer) -> SoapClient {
        let http = HttpClient::builder().build().unwrap();
        SoapClient::new(server.uri(), http, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_get_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("SOAPAction", "http://roblox.com/GetVersion"))
            .respond_with(ResponseTemplate::new(200).set_body_string(wrap(
                "GetVersion",
                "<ns1:GetVersionResult>2.0.1</ns1:GetVersionResult>",
            )))
            .mount(&server)
            .await;

        let version = client(&server).get_version().await.unwrap();
        assert_eq!(version, "2.0.1");
    }

    #[tokio::test]
    async fn test_execute_command_sends_job_and_script() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("SOAPAction", "http://roblox.com/ExecuteEx"))
            .and(body_string_contains("<ns1:jobID>abc</ns1:jobID>"))
            .and(body_string_contains("&quot;Mode&quot;:&quot;ExecuteScript&quot;"))
            .respond_with(ResponseTemplate::new(200).set_body_string(wrap(
                "ExecuteEx",
                "<ns1:ExecuteExResult><ns1:LuaValue><ns1:type>LUA_TSTRING</ns1:type><ns1:value>ok</ns1:value></ns1:LuaValue></ns1:ExecuteExResult>",
            )))
            .mount(&server)
            .await;

        let soap = client(&server);
        let command = GridCommand::execute_script("Test", Default::default()).unwrap();
        let values = crate::rpc::execute_command(&soap, "abc", &command)
            .await
            .unwrap();

        assert_eq!(values, vec![LuaValue::from("ok")]);
    }

    #[tokio::test]
    async fn test_fault_on_http_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/"><SOAP-ENV:Body><SOAP-ENV:Fault><faultcode>SOAP-ENV:Server</faultcode><faultstring>Job not found</faultstring></SOAP-ENV:Fault></SOAP-ENV:Body></SOAP-ENV:Envelope>"#,
            ))
            .mount(&server)
            .await;

        let err = client(&server).close_job("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::SoapFault { ref message, .. } if message == "Job not found"));
    }

    #[tokio::test]
    async fn test_unavailable_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = client(&server).get_all_jobs().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_renew_lease_returns_expiration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("SOAPAction", "http://roblox.com/RenewLease"))
            .and(body_string_contains("<ns1:expirationInSeconds>120</ns1:expirationInSeconds>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(wrap(
                "RenewLease",
                "<ns1:RenewLeaseResult>120</ns1:RenewLeaseResult>",
            )))
            .mount(&server)
            .await;

        let expiration = client(&server).renew_lease("abc", 120.0).await.unwrap();
        assert_eq!(expiration, 120.0);
    }
}
