//! Command dispatch: the interpretation service and the sinks that carry out
//! its answer

mod http;

pub use http::{HttpActionSink, HttpInterpreter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Backend call produced by a `create` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Interpreted command
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Navigate {
        route: String,
        message: String,
    },
    Invoke {
        call: ApiCall,
        message: String,
        /// Page to show once the call succeeded
        follow_up: Option<String>,
    },
    Say {
        message: String,
    },
    /// Unrecognized action; only the message is used
    Unknown {
        message: String,
    },
}

impl DispatchResult {
    pub fn message(&self) -> &str {
        match self {
            DispatchResult::Navigate { message, .. }
            | DispatchResult::Invoke { message, .. }
            | DispatchResult::Say { message }
            | DispatchResult::Unknown { message } => message,
        }
    }
}

/// Request body of the interpretation service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
}

/// Response body of the interpretation service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub action_type: String,
    #[serde(default)]
    pub target_page: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub api_call: Option<ApiCall>,
    #[serde(default)]
    pub message: String,
}

impl From<ChatResponse> for DispatchResult {
    fn from(response: ChatResponse) -> Self {
        let ChatResponse {
            action_type,
            target_page,
            route,
            api_call,
            message,
        } = response;
        let page_route = target_page
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| format!("/{}", p.trim_start_matches('/')));
        let route = route.filter(|r| !r.trim().is_empty());

        match action_type.trim().to_ascii_lowercase().as_str() {
            "navigate" => match route.or(page_route) {
                Some(route) => DispatchResult::Navigate { route, message },
                None => DispatchResult::Unknown { message },
            },
            "create" => match api_call {
                Some(call) => DispatchResult::Invoke {
                    call,
                    message,
                    follow_up: page_route,
                },
                None => DispatchResult::Unknown { message },
            },
            "show" => match route.or(page_route) {
                Some(route) => DispatchResult::Navigate { route, message },
                None => DispatchResult::Say { message },
            },
            "general" => DispatchResult::Say { message },
            _ => DispatchResult::Unknown { message },
        }
    }
}

/// Natural-language interpretation service
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(&self, query: &str) -> Result<DispatchResult, DispatchError>;
}

/// Receives routes to show
pub trait NavigationSink: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Executes backend calls
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn invoke(&self, call: &ApiCall) -> Result<(), DispatchError>;
}
