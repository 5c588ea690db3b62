//! Synthesizer：根据完整证据生成最终回答
//!
//! 推理服务不可用或返回空文本时，退化为本地拼接的证据摘要，保证回答永不为空。
//! 部分答案（预算耗尽、终止性错误、取消、任务被放弃）统一加上 `[Partial answer: ...]` 前缀。

use std::sync::Arc;

use crate::llm::{LlmClient, LlmRequest, Message, RequestPurpose};
use crate::react::events::Transcript;
use crate::react::evidence::ToolOutput;
use crate::react::{prompts, reasoning};

const FALLBACK_BODY_CHARS: usize = 400;

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// evidence 为 Context Manager 渲染后的文本；partial 为部分答案原因
    pub async fn synthesize(
        &self,
        query: &str,
        evidence: &str,
        outputs: &[&ToolOutput],
        partial: Option<&str>,
        transcript: &mut Transcript,
    ) -> String {
        let mut system = prompts::SYNTHESIS_SYSTEM.to_string();
        if partial.is_some() {
            system.push_str("\n\n");
            system.push_str(prompts::PARTIAL_NOTICE);
        }
        let request = LlmRequest::new(
            RequestPurpose::Synthesis,
            vec![
                Message::system(system),
                Message::user(format!("Query:\n{query}\n\nEvidence:\n{evidence}")),
            ],
        );

        let body = match reasoning::complete(self.llm.as_ref(), &request, transcript).await {
            Ok(resp) => {
                let text = resp.into_text();
                if text.trim().is_empty() {
                    tracing::warn!("empty synthesis response, using evidence digest");
                    offline_answer(query, outputs)
                } else {
                    text
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, using evidence digest");
                offline_answer(query, outputs)
            }
        };

        match partial {
            Some(reason) => format!("[Partial answer: {reason}]\n\n{body}"),
            None => body,
        }
    }
}

/// 不依赖推理服务的证据摘要
pub fn offline_answer(query: &str, outputs: &[&ToolOutput]) -> String {
    if outputs.is_empty() {
        return format!("No evidence could be gathered for: {query}");
    }
    let mut out = format!(
        "The reasoning service could not write a summary. Evidence gathered for \"{query}\":\n"
    );
    for o in outputs {
        let body = o.body();
        let clipped: String = body.chars().take(FALLBACK_BODY_CHARS).collect();
        let ellipsis = if body.chars().count() > FALLBACK_BODY_CHARS { "..." } else { "" };
        out.push_str(&format!("- task {} {}: {clipped}{ellipsis}\n", o.task_id, o.tool_name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, LlmResponse, MockLlmClient};
    use crate::react::evidence::{Action, EvidenceLog};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_partial_prefix_and_notice() {
        let mock = Arc::new(MockLlmClient::new().with(
            RequestPurpose::Synthesis,
            LlmResponse::Text("HbA1c 8.1% on 2023-04-02.".into()),
        ));
        let s = Synthesizer::new(mock.clone());
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let answer = s.synthesize("q", "", &[], Some("global step budget exhausted"), &mut t).await;
        assert_eq!(answer, "[Partial answer: global step budget exhausted]\n\nHbA1c 8.1% on 2023-04-02.");
        assert!(mock.requests()[0].messages[0].content.contains(prompts::PARTIAL_NOTICE));
    }

    #[tokio::test]
    async fn test_offline_digest_when_service_fails() {
        let mock = Arc::new(MockLlmClient::new().with_error(
            RequestPurpose::Synthesis,
            LlmError::Auth("bad key".into()),
        ));
        let mut log = EvidenceLog::new();
        log.record(1, &Action::new("list_patients", json!({})), Ok(json!({"patient_ids": ["p1", "p2"]})));
        let s = Synthesizer::new(mock);
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let answer = s.synthesize("who?", "", &log.all(), None, &mut t).await;
        assert!(answer.contains("list_patients"));
        assert!(answer.contains("p2"));
        assert!(!offline_answer("q", &[]).is_empty());
    }
}
