use anyhow::Result;
use async_trait::async_trait;
use bridge_core::net::{HttpClient, HttpRequest, HttpResponse};
use ureq::Agent;

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx statuses are returned as regular responses so callers can read
/// the homeserver's error body.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        let config = Agent::config_builder().http_status_as_error(false).build();
        Self {
            agent: config.into(),
        }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn execute_blocking(agent: &Agent, request: HttpRequest) -> Result<HttpResponse> {
    let body = request.body.unwrap_or_default();
    let response = match request.method.as_str() {
        "GET" => {
            let mut req = agent.get(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        "POST" => {
            let mut req = agent.post(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.send(&body[..])?
        }
        "PUT" => {
            let mut req = agent.put(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.send(&body[..])?
        }
        method => {
            return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
        }
    };

    let status_code = response.status().as_u16();

    // Read the response body
    let mut body = response.into_body();
    let body_bytes = body.read_to_vec()?;

    Ok(HttpResponse {
        status_code,
        body: body_bytes,
    })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        // Since ureq is blocking, we must use spawn_blocking
        tokio::task::spawn_blocking(move || execute_blocking(&agent, request)).await?
    }
}
