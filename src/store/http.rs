use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};

use crate::config::ApiConfig;
use crate::store::{Document, ResourceStore, SearchQuery, SearchResults, StoreError};

/// REST client for the resource API.
///
/// Resources live under `{endpoint}/api/`: collections are addressed by name
/// (`jobs`), resources by id (`job/<uuid>`). Authentication is a cookie
/// session obtained through [`HttpResourceStore::login`]; when the server
/// answers 401 later on, the store logs in again with the same credentials
/// and retries the request once.
pub struct HttpResourceStore {
    client: Client,
    endpoint: String,
    credentials: Mutex<Option<(String, String)>>,
}

impl HttpResourceStore {
    pub fn new(config: &ApiConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.request_timeout)
            .user_agent(concat!("job-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credentials: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.endpoint, path)
    }

    /// Opens a session with internal credentials. The session cookie is kept
    /// by the client for every later request.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let body = json!({
            "sessionTemplate": {
                "href": "session-template/internal",
                "username": username,
                "password": password,
            }
        });

        let response = self
            .client
            .post(self.url("session"))
            .json(&body)
            .send()
            .await?;

        match check(response, "session").await {
            Ok(_) => {
                tracing::info!(endpoint = %self.endpoint, username, "Session opened");
                *self.credentials.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((username.to_string(), password.to_string()));
                Ok(())
            }
            Err(StoreError::Api { status, message }) if status == 400 => {
                Err(StoreError::Unauthorized(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Sends the request `build` produces and maps its status. An expired
    /// session (401) is reopened once and the request sent again.
    async fn send<F>(&self, id: &str, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder + Send,
    {
        let response = build().send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response, id).await;
        }

        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some((username, password)) = credentials else {
            return check(response, id).await;
        };

        tracing::warn!(endpoint = %self.endpoint, id, "Session expired, logging in again");
        self.login(&username, &password).await?;
        check(build().send().await?, id).await
    }
}

/// Maps non-success statuses onto [`StoreError`] variants.
async fn check(response: Response, id: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(id.to_string()),
        StatusCode::CONFLICT => StoreError::Conflict(id.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            StoreError::Unavailable(message)
        }
        _ => StoreError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl ResourceStore for HttpResourceStore {
    async fn create(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let url = self.url(collection);
        let response = self
            .send(collection, || self.client.post(&url).json(&doc))
            .await?;
        let body: Value = response.json().await?;

        body.get("resource-id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Api {
                status: 201,
                message: format!("create in {} returned no resource-id", collection),
            })
    }

    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        let url = self.url(id);
        let response = self.send(id, || self.client.get(&url)).await?;
        Ok(response.json().await?)
    }

    async fn edit(&self, id: &str, partial: Document) -> Result<Document, StoreError> {
        let url = self.url(id);
        let response = self
            .send(id, || self.client.put(&url).json(&partial))
            .await?;
        Ok(response.json().await?)
    }

    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<SearchResults, StoreError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.to_string()));
        }
        if let Some(first) = query.first {
            params.push(("first", first.to_string()));
        }
        if let Some(last) = query.last {
            params.push(("last", last.to_string()));
        }

        let url = self.url(collection);
        let response = self
            .send(collection, || self.client.put(&url).form(&params))
            .await?;
        let mut body: Value = response.json().await?;

        let count = body.get("count").and_then(Value::as_u64).unwrap_or(0);
        let resources = match body.get_mut(collection).map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        Ok(SearchResults { count, resources })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let url = self.url(id);
        self.send(id, || self.client.delete(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_under_api() {
        let config = ApiConfig::default().with_endpoint("https://example.org/");
        let store = HttpResourceStore::new(&config).unwrap();
        assert_eq!(store.endpoint(), "https://example.org");
        assert_eq!(store.url("jobs"), "https://example.org/api/jobs");
        assert_eq!(store.url("job/1"), "https://example.org/api/job/1");
    }
}
