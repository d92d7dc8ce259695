use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, COOKIE};

use crate::config::JobOptions;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
        }
    }
}

pub struct NetResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl NetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub trait NetClient: Send + Sync {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(options: &JobOptions) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .user_agent(options.user_agent.as_str())
            .connect_timeout(options.overtime)
            .danger_accept_invalid_certs(!options.verify_tls);
        if let Some(timeout) = options.down_overtime {
            builder = builder.timeout(timeout.max(Duration::from_secs(1)));
        }
        if let Some(proxy_url) = &options.down_proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| CoreError::Config(format!("proxy {}: {}", proxy_url, err)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Config(format!("header {}: {}", key, err)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Config(format!("header {}: {}", key, err)))?;
            headers.insert(name, value);
        }
        if !req.cookies.is_empty() {
            let cookie_value = req
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<String>>()
                .join("; ");
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&cookie_value)
                    .map_err(|err| CoreError::Config(format!("cookie: {}", err)))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn get(&self, req: &DownloadRequest) -> CoreResult<NetResponse> {
        let resp = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        Ok(NetResponse {
            status_code: resp.status().as_u16(),
            content_length,
            body: Box::new(resp),
        })
    }
}
