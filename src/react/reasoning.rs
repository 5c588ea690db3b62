//! 带事件记录的推理调用：每次请求 / 响应 / 失败都写入 Transcript

use serde::de::DeserializeOwned;
use serde_json::json;

use crate::llm::{extract_json, LlmClient, LlmError, LlmRequest, LlmResponse};
use crate::react::events::{EventKind, Transcript};

const PREVIEW_CHARS: usize = 300;

fn preview(s: &str) -> String {
    if s.chars().count() > PREVIEW_CHARS {
        format!("{}...", s.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

pub async fn complete(
    llm: &dyn LlmClient,
    request: &LlmRequest,
    transcript: &mut Transcript,
) -> Result<LlmResponse, LlmError> {
    transcript.record(
        EventKind::ReasoningRequest,
        json!({
            "purpose": request.purpose,
            "messages": request.messages.len(),
            "chars": request.content_chars(),
            "tools": request.tools.len(),
            "images": request.images.len(),
            "structured": request.response_schema.is_some(),
        }),
    );
    match llm.complete(request).await {
        Ok(resp) => {
            let detail = match &resp {
                LlmResponse::ToolCall(tc) => json!({"tool": tc.name, "arguments": tc.arguments}),
                LlmResponse::Text(t) => json!({"text": preview(t)}),
                LlmResponse::Structured(v) => json!({"value": preview(&v.to_string())}),
            };
            transcript.record(
                EventKind::ReasoningResponse,
                json!({"purpose": request.purpose, "kind": resp.kind(), "detail": detail}),
            );
            Ok(resp)
        }
        Err(e) => {
            transcript.record(
                EventKind::Error,
                json!({"purpose": request.purpose, "error": e.to_string(), "retryable": e.is_retryable()}),
            );
            Err(e)
        }
    }
}

fn decode_failure(transcript: &mut Transcript, request: &LlmRequest, message: String) -> LlmError {
    let err = LlmError::Decode(message);
    transcript.record(
        EventKind::Error,
        json!({"purpose": request.purpose, "error": err.to_string(), "retryable": false}),
    );
    err
}

/// 结构化调用：结构化对象 / 文本中的 JSON 均可，解码失败为 LlmError::Decode 并记录 Error 事件
pub async fn complete_structured<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    request: &LlmRequest,
    transcript: &mut Transcript,
) -> Result<T, LlmError> {
    let value = match complete(llm, request, transcript).await? {
        LlmResponse::Structured(v) => v,
        LlmResponse::ToolCall(tc) => tc.arguments,
        LlmResponse::Text(t) => match extract_json(&t) {
            Some(v) => v,
            None => {
                let message = format!("no JSON object in response: {}", preview(&t));
                return Err(decode_failure(transcript, request, message));
            }
        },
    };
    serde_json::from_value(value).map_err(|e| decode_failure(transcript, request, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, MockLlmClient, RequestPurpose};
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        done: bool,
    }

    fn request() -> LlmRequest {
        LlmRequest::new(RequestPurpose::TaskValidation, vec![Message::user("done?")])
    }

    #[tokio::test]
    async fn test_text_without_json_records_decode_error() {
        let mock = MockLlmClient::new().with(RequestPurpose::TaskValidation, LlmResponse::Text("looks finished to me".into()));
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let err = complete_structured::<Verdict>(&mock, &request(), &mut t).await.unwrap_err();
        assert!(matches!(err, LlmError::Decode(_)));
        assert_eq!(t.count(EventKind::Error), 1);
        assert_eq!(t.count(EventKind::ReasoningResponse), 1);
    }

    #[tokio::test]
    async fn test_wrong_shape_records_decode_error() {
        let mock = MockLlmClient::new().with(RequestPurpose::TaskValidation, LlmResponse::Structured(json!({"finished": 1})));
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        assert!(complete_structured::<Verdict>(&mock, &request(), &mut t).await.is_err());
        assert_eq!(t.count(EventKind::Error), 1);
    }

    #[tokio::test]
    async fn test_json_in_text_decodes() {
        let mock = MockLlmClient::new().with(
            RequestPurpose::TaskValidation,
            LlmResponse::Text("Result: {\"done\": true}".into()),
        );
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let v: Verdict = complete_structured(&mock, &request(), &mut t).await.unwrap();
        assert!(v.done);
        assert_eq!(t.count(EventKind::Error), 0);
    }
}
