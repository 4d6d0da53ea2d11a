//! HTTP implementations of the interpretation service and the CRUD action sink

use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

use crate::error::DispatchError;

use super::{ActionSink, ApiCall, ChatRequest, ChatResponse, DispatchResult, Interpreter};

/// `POST {base}/chat` client
#[derive(Clone)]
pub struct HttpInterpreter {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpInterpreter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            chat_url: join_url(base_url, "/chat"),
        }
    }
}

#[async_trait]
impl Interpreter for HttpInterpreter {
    async fn interpret(&self, query: &str) -> Result<DispatchResult, DispatchError> {
        debug!(url = %self.chat_url, %query, "dispatching command");

        let response = self
            .client
            .post(&self.chat_url)
            .json(&ChatRequest {
                query: query.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        let chat: ChatResponse = serde_json::from_slice(&body)?;
        debug!(action_type = %chat.action_type, "interpretation received");
        Ok(chat.into())
    }
}

/// Issues backend calls against the dashboard API
#[derive(Clone)]
pub struct HttpActionSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpActionSink {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ActionSink for HttpActionSink {
    async fn invoke(&self, call: &ApiCall) -> Result<(), DispatchError> {
        let method = Method::from_bytes(call.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| DispatchError::InvalidAction(format!("method {:?}", call.method)))?;
        let url = join_url(&self.base_url, &call.endpoint);
        debug!(%method, %url, "invoking action");

        let mut request = self.client.request(method, &url);
        if !call.data.is_null() {
            request = request.json(&call.data);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Relative endpoints hang off the base; absolute URLs pass through
fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://api:8050/", "/chat"), "http://api:8050/chat");
        assert_eq!(join_url("http://api:8050", "api/users"), "http://api:8050/api/users");
        assert_eq!(
            join_url("http://api:8050", "https://other/x"),
            "https://other/x"
        );
    }

    #[tokio::test]
    async fn test_interpreter_posts_query_and_decodes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"query": "show me users"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"action_type":"navigate","route":"/users","message":"Navigating to users"}"#,
            )
            .create_async()
            .await;

        let interpreter = HttpInterpreter::new(reqwest::Client::new(), &server.url());
        let result = interpreter.interpret("show me users").await.unwrap();

        mock.assert_async().await;
        assert_eq!(
            result,
            DispatchResult::Navigate {
                route: "/users".into(),
                message: "Navigating to users".into()
            }
        );
    }

    #[tokio::test]
    async fn test_interpreter_reports_server_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(502)
            .create_async()
            .await;

        let interpreter = HttpInterpreter::new(reqwest::Client::new(), &server.url());
        let err = interpreter.interpret("anything").await.unwrap_err();
        assert!(matches!(err, DispatchError::Status(502)));
    }

    #[tokio::test]
    async fn test_interpreter_reports_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let interpreter = HttpInterpreter::new(reqwest::Client::new(), &server.url());
        let err = interpreter.interpret("anything").await.unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_action_sink_sends_payload_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/users")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"name": "John", "phone_number": "123456789"}),
            ))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let sink = HttpActionSink::new(reqwest::Client::new(), &server.url());
        let call = ApiCall {
            method: "post".into(),
            endpoint: "/api/users".into(),
            data: serde_json::json!({"name": "John", "phone_number": "123456789"}),
        };
        sink.invoke(&call).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_action_sink_rejects_bad_method() {
        let sink = HttpActionSink::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let call = ApiCall {
            method: "NOT A METHOD".into(),
            endpoint: "/api/users".into(),
            data: serde_json::Value::Null,
        };
        let err = sink.invoke(&call).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidAction(_)));
    }
}
