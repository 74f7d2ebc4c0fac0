use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let headers = self.get_headers(auth_token)?;
        self.send(method, path, headers, body).await
    }

    /// PATCH rows of `table` matching a PostgREST `filter` (e.g. `id=eq.42`)
    /// and return the updated representation.
    pub async fn patch_rows(
        &self,
        table: &str,
        filter: &str,
        auth_token: Option<&str>,
        body: Value,
    ) -> Result<Vec<Value>> {
        let mut headers = self.get_headers(auth_token)?;
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let path = format!("/rest/v1/{}?{}", table, filter);
        self.send(Method::PATCH, &path, headers, Some(body)).await
    }

    async fn send<T>(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_config::{AppConfig, NegotiationMode};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> AppConfig {
        AppConfig {
            supabase_url: url,
            supabase_anon_key: "anon-key".to_string(),
            ice_servers: Vec::new(),
            negotiation_mode: NegotiationMode::Loopback,
            relay_join_timeout_secs: 1,
            relay_heartbeat_secs: 25,
            agent_port: 0,
        }
    }

    #[tokio::test]
    async fn test_patch_rows_sends_filter_and_prefer_header() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/appointments"))
            .and(query_param("id", "eq.appt-1"))
            .and(header("apikey", "anon-key"))
            .and(header("Authorization", "Bearer token"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({ "status": "completed" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "id": "appt-1", "status": "completed" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config(server.uri()));
        let rows = client
            .patch_rows("appointments", "id=eq.appt-1", Some("token"), json!({ "status": "completed" }))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_request_maps_auth_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/appointments"))
            .respond_with(ResponseTemplate::new(401).set_body_string("JWT expired"))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config(server.uri()));
        let err = client
            .request::<Value>(Method::GET, "/rest/v1/appointments", Some("token"), None)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Authentication error"));
    }
}
