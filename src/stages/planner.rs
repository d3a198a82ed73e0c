use anvil_common::Plan;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::Planner;
use super::openai::{ChatClient, ChatMessage, ChatRequest, ChatResponse, ResponseFormat};
use super::prompts;
use crate::errors::PlanningError;

/// Keys some models wrap the plan in despite being told not to.
const WRAPPER_KEYS: &[&str] = &["execution_plan", "plan", "response"];

pub const DEFAULT_PLANNER_TEMPERATURE: f32 = 0.2;

/// Planner backed by an OpenAI-compatible endpoint in JSON mode.
pub struct HttpPlanner {
    client: ChatClient,
    model: String,
    temperature: f32,
}

impl HttpPlanner {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: DEFAULT_PLANNER_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, request_text: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(prompts::planner_system_prompt()),
                ChatMessage::user(request_text),
            ],
            temperature: self.temperature,
            response_format: Some(ResponseFormat::json_object()),
            stream: false,
        }
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, request_text: &str) -> Result<Plan, PlanningError> {
        let started = std::time::Instant::now();
        let response = self.client.send(&self.build_request(request_text)).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(PlanningError::Transport)?;
        let content = body.first_content().ok_or(PlanningError::EmptyResponse)?;
        debug!(chars = content.len(), "planner response received");

        let plan = decode_plan(content)?;
        info!(
            steps = plan.steps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plan created"
        );
        Ok(plan)
    }
}

/// Turn raw model output into a validated `Plan`.
///
/// Tolerates Markdown fences or prose around the JSON by cutting to the
/// outermost `{...}`, and unwraps a single wrapper key when the object has
/// no `steps` of its own.
pub fn decode_plan(raw: &str) -> Result<Plan, PlanningError> {
    if raw.trim().is_empty() {
        return Err(PlanningError::EmptyResponse);
    }

    let parse_err = |message: String| PlanningError::Parse {
        message,
        raw: raw.to_string(),
    };

    let json = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return Err(parse_err("no JSON object in response".to_string())),
    };

    let mut value: Value =
        serde_json::from_str(json).map_err(|e| parse_err(format!("invalid JSON: {}", e)))?;

    if value.get("steps").is_none()
        && let Some(inner) = WRAPPER_KEYS
            .iter()
            .find_map(|key| value.get(*key).filter(|v| v.is_object()))
    {
        value = inner.clone();
    }

    let plan: Plan = serde_json::from_value(value)
        .map_err(|e| parse_err(format!("response does not match the plan shape: {}", e)))?;
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::openai::{ChatTimeouts, fake_server};
    use anvil_common::PlanError;
    use std::time::Duration;

    const PLAN_JSON: &str = r#"{
        "analysis": "sum two ints",
        "steps": [{"id": 1, "action": "print", "details": "print(1+1)"}],
        "estimated_complexity": "low",
        "safety_flag": true
    }"#;

    #[test]
    fn test_decode_flat_plan() {
        let plan = decode_plan(PLAN_JSON).unwrap();
        assert_eq!(plan.analysis, "sum two ints");
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.safety_flag);
    }

    #[test]
    fn test_decode_strips_fences_and_prose() {
        let raw = format!("Here is the plan:\n```json\n{}\n```\nGood luck!", PLAN_JSON);
        assert!(decode_plan(&raw).is_ok());
    }

    #[test]
    fn test_decode_unwraps_wrapper_keys() {
        for key in ["execution_plan", "plan", "response"] {
            let raw = format!("{{\"{}\": {}}}", key, PLAN_JSON);
            let plan = decode_plan(&raw).unwrap_or_else(|e| panic!("{}: {}", key, e));
            assert_eq!(plan.steps[0].action, "print");
        }
    }

    #[test]
    fn test_decode_empty_is_empty_response() {
        assert!(matches!(decode_plan("  \n"), Err(PlanningError::EmptyResponse)));
    }

    #[test]
    fn test_decode_no_object_keeps_raw() {
        match decode_plan("I cannot help with that.") {
            Err(PlanningError::Parse { raw, .. }) => assert_eq!(raw, "I cannot help with that."),
            other => panic!("Expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_wrong_shape_is_parse_error() {
        let err = decode_plan(r#"{"analysis": "x", "steps": "none"}"#).unwrap_err();
        assert!(matches!(err, PlanningError::Parse { .. }));
    }

    #[test]
    fn test_decode_rejects_empty_steps() {
        let raw = r#"{"analysis":"x","steps":[],"estimated_complexity":"low","safety_flag":true}"#;
        assert!(matches!(
            decode_plan(raw),
            Err(PlanningError::Invalid(PlanError::NoSteps))
        ));
    }

    #[test]
    fn test_decode_rejects_duplicate_ids() {
        let raw = r#"{"analysis":"x","steps":[
            {"id":3,"action":"a","details":"d"},
            {"id":3,"action":"b","details":"d"}
        ],"estimated_complexity":"low","safety_flag":true}"#;
        assert!(matches!(
            decode_plan(raw),
            Err(PlanningError::Invalid(PlanError::DuplicateStepId { id: 3 }))
        ));
    }

    #[tokio::test]
    async fn test_http_planner_round_trip() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": PLAN_JSON}}]
        })
        .to_string();
        let server = fake_server::serve_once("200 OK", "application/json", &body).await;
        let planner = HttpPlanner::new(ChatClient::new(&server.base_url, "k").unwrap(), "test-model");

        let plan = planner.plan("add two numbers").await.unwrap();
        assert_eq!(plan.steps[0].details, "print(1+1)");

        let raw = server.request.await.unwrap();
        assert!(raw.contains("\"json_object\""));
        assert!(raw.contains("add two numbers"));
        assert!(raw.contains("\"test-model\""));
    }

    #[tokio::test]
    async fn test_http_planner_no_choices_is_empty_response() {
        let server =
            fake_server::serve_once("200 OK", "application/json", r#"{"choices":[]}"#).await;
        let planner = HttpPlanner::new(ChatClient::new(&server.base_url, "k").unwrap(), "m");
        assert!(matches!(
            planner.plan("x").await,
            Err(PlanningError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_http_planner_silent_endpoint_is_transport_timeout() {
        let server = fake_server::silent().await;
        let timeouts = ChatTimeouts {
            request: Duration::from_millis(300),
            ..ChatTimeouts::default()
        };
        let client = ChatClient::with_timeouts(&server.base_url, "k", timeouts).unwrap();
        let planner = HttpPlanner::new(client, "m");

        let result = tokio::time::timeout(Duration::from_secs(10), planner.plan("add two numbers"))
            .await
            .expect("planner hung past its request timeout");
        match result {
            Err(PlanningError::Transport(e)) => assert!(e.is_timeout()),
            other => panic!("Expected Transport timeout, got {:?}", other),
        }
    }
}
