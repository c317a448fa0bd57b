//! Alarm Action HTTP Client
//!
//! [`AlarmActionPort`] over the monitoring server's REST API:
//!
//! - `POST {base}/alarms/{id}/{acknowledge|resolve|ignore|escalate|assign}`
//! - `POST {base}/alarms/{id}/classify`
//!
//! Requests carry the bearer credential. 404 maps to `NotFound`, other 4xx
//! to `Rejected`, 5xx and network failures to `Transport`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::ports::{
    ActionError, AlarmActionAck, AlarmActionPort, AlarmActionRequest, AlarmCommand, ClassificationRequest, Credential,
};
use crate::domain::alarm::{AlarmAction, Classification};
use crate::infrastructure::socket::parse_status;

/// Construction errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The base URL is empty or not http(s).
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Settings for the alarm action client.
#[derive(Debug, Clone)]
pub struct AlarmApiConfig {
    /// REST base URL, without trailing slash.
    pub base_url: String,
    /// Bearer credential.
    pub credential: Credential,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handler: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ClassifyBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    handled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassificationBody {
    category: String,
    confidence: f64,
    #[serde(default)]
    suggested_action: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

/// HTTP implementation of [`AlarmActionPort`].
#[derive(Debug, Clone)]
pub struct AlarmApiClient {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl AlarmApiClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Fails on a malformed base URL or if the HTTP client cannot be built.
    pub fn new(config: AlarmApiConfig) -> Result<Self, ApiError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidBaseUrl(config.base_url));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url,
            credential: config.credential,
        })
    }

    async fn post<B: Serialize + Sync>(&self, alarm_id: &str, segment: &str, body: &B) -> Result<Value, ActionError> {
        let url = format!("{}/alarms/{alarm_id}/{segment}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credential.token())
            .json(body)
            .send()
            .await
            .map_err(|e| ActionError::Transport { message: e.to_string() })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Transport { message: e.to_string() })?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            let value: Value = serde_json::from_str(&text).map_err(|e| ActionError::Transport {
                message: format!("invalid response body: {e}"),
            })?;
            return Ok(unwrap_envelope(value));
        }

        let message = serde_json::from_str::<ErrorBody>(&text).map_or_else(|_| text.clone(), |body| body.message);
        tracing::debug!(alarm_id, segment, status = status.as_u16(), message = %message, "Alarm API error");
        Err(match status {
            StatusCode::NOT_FOUND => ActionError::NotFound {
                alarm_id: alarm_id.to_string(),
            },
            status if status.is_client_error() => ActionError::Rejected { message },
            status => ActionError::Transport {
                message: format!("{status}: {message}"),
            },
        })
    }
}

#[async_trait]
impl AlarmActionPort for AlarmApiClient {
    async fn execute(&self, request: AlarmActionRequest) -> Result<AlarmActionAck, ActionError> {
        let body = ActionBody {
            note: request.note.as_deref(),
            handler: match &request.command {
                AlarmCommand::Assign { handler } => Some(handler.as_str()),
                AlarmCommand::Transition(_) => None,
            },
        };
        let value = self.post(&request.alarm_id, request.command.path(), &body).await?;

        let ack: AckBody = if value.is_null() {
            AckBody::default()
        } else {
            serde_json::from_value(value).map_err(|e| ActionError::Transport {
                message: format!("invalid ack: {e}"),
            })?
        };
        let status = ack.status.as_deref().and_then(|status| {
            parse_status(status)
                .inspect_err(|error| tracing::warn!(error = %error, "Ignoring unknown status in ack"))
                .ok()
        });

        Ok(AlarmActionAck {
            alarm_id: ack.id.unwrap_or(request.alarm_id),
            status,
            handler: ack.handler,
            handled_at: ack.handled_at,
        })
    }

    async fn classify(&self, request: ClassificationRequest) -> Result<Classification, ActionError> {
        let body = ClassifyBody {
            strategy: request.strategy.map(|strategy| strategy.as_str()),
        };
        let value = self.post(&request.alarm_id, "classify", &body).await?;
        let body: ClassificationBody = serde_json::from_value(value).map_err(|e| ActionError::Transport {
            message: format!("invalid classification: {e}"),
        })?;

        Ok(Classification {
            category: body.category,
            confidence: body.confidence,
            suggested_action: body.suggested_action.as_deref().and_then(parse_action),
            reasoning: body.reasoning,
        })
    }
}

/// Accept both a bare body and `{"data": {...}}`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn parse_action(value: &str) -> Option<AlarmAction> {
    match value.trim().to_ascii_lowercase().as_str() {
        "acknowledge" | "ack" => Some(AlarmAction::Acknowledge),
        "resolve" => Some(AlarmAction::Resolve),
        "ignore" => Some(AlarmAction::Ignore),
        "escalate" => Some(AlarmAction::Escalate),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::alarm::AlarmStatus;
    use crate::domain::bulk::BulkStrategy;

    fn client(server: &MockServer) -> AlarmApiClient {
        AlarmApiClient::new(AlarmApiConfig {
            base_url: format!("{}/", server.uri()),
            credential: Credential::new("secret"),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn acknowledge_posts_note_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alarms/a-1/acknowledge"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"note": "on my way"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "a-1", "status": "acknowledged", "handler": "oiler",
                         "handledAt": "2026-03-01T10:00:00Z"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ack = client(&server)
            .execute(AlarmActionRequest::transition("a-1", AlarmAction::Acknowledge, Some("on my way")))
            .await
            .unwrap();

        assert_eq!(ack.status, Some(AlarmStatus::Processing));
        assert_eq!(ack.handler.as_deref(), Some("oiler"));
        assert!(ack.handled_at.is_some());
    }

    #[tokio::test]
    async fn empty_success_body_is_a_bare_ack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alarms/a-1/assign"))
            .and(body_json(json!({"handler": "bosun"})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let ack = client(&server)
            .execute(AlarmActionRequest::assign("a-1", "bosun"))
            .await
            .unwrap();

        assert_eq!(ack.alarm_id, "a-1");
        assert!(ack.status.is_none());
    }

    #[tokio::test]
    async fn status_codes_map_to_errors() {
        let server = MockServer::start().await;
        Mock::given(path("/alarms/gone/resolve"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/alarms/locked/resolve"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({"message": "alarm locked"})))
            .mount(&server)
            .await;
        Mock::given(path("/alarms/broken/resolve"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = client(&server);
        let resolve = |id: &str| AlarmActionRequest::transition(id, AlarmAction::Resolve, None);

        assert_eq!(
            client.execute(resolve("gone")).await,
            Err(ActionError::NotFound { alarm_id: "gone".into() })
        );
        assert_eq!(
            client.execute(resolve("locked")).await,
            Err(ActionError::Rejected {
                message: "alarm locked".into()
            })
        );
        assert!(matches!(
            client.execute(resolve("broken")).await,
            Err(ActionError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn classify_parses_suggestion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alarms/a-2/classify"))
            .and(body_json(json!({"strategy": "by_severity"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "category": "sensor drift", "confidence": 0.72,
                "suggestedAction": "ignore", "reasoning": "flatline"
            })))
            .mount(&server)
            .await;

        let classification = client(&server)
            .classify(ClassificationRequest {
                alarm_id: "a-2".into(),
                strategy: Some(BulkStrategy::BySeverity),
            })
            .await
            .unwrap();

        assert_eq!(classification.category, "sensor drift");
        assert_eq!(classification.suggested_action, Some(AlarmAction::Ignore));
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let client = AlarmApiClient::new(AlarmApiConfig {
            base_url: "http://127.0.0.1:9".into(),
            credential: Credential::new("secret"),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let result = client.classify(ClassificationRequest::single("a-1")).await;

        assert!(matches!(result, Err(ActionError::Transport { .. })));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let result = AlarmApiClient::new(AlarmApiConfig {
            base_url: "ftp://example".into(),
            credential: Credential::new("secret"),
            timeout: Duration::from_secs(1),
        });

        assert!(matches!(result, Err(ApiError::InvalidBaseUrl(_))));
    }
}
