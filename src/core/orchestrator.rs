//! Agent 编排器：对外的调用边界
//!
//! 持有 Planner / Selector / Validator / Synthesizer / 执行器等共享组件，每次 run 新建一份会话状态；
//! 会话之间不共享任何可变状态。

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine, StepBudget};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryingLlmClient};
use crate::react::{
    run_session, ActionSelector, ContextManager, EventSink, Planner, ReactSession, RunOutcome,
    Synthesizer, Validator,
};
use crate::tools::ToolExecutor;

/// 根据配置选择推理后端（OpenAI 兼容 / Mock），统一包上重试网关
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = cfg.llm.provider.to_lowercase();
    let inner: Arc<dyn LlmClient> = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        "openai" => match std::env::var(&cfg.llm.api_key_env) {
            Ok(key) if !key.trim().is_empty() => {
                tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
                let client = OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    key.trim(),
                    cfg.llm.request_timeout(),
                    cfg.llm.max_tokens,
                )
                .map_err(|e| AgentError::ConfigError(e.to_string()))?;
                Arc::new(client)
            }
            _ => {
                tracing::warn!(env = %cfg.llm.api_key_env, "No API key set, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        },
        other => {
            return Err(AgentError::ConfigError(format!(
                "unknown llm provider '{other}' (expected openai or mock)"
            )))
        }
    };
    Ok(Arc::new(RetryingLlmClient::new(
        inner,
        cfg.llm.retry.to_retry_config(),
    )))
}

/// 附件以带标签的文本块追加到查询之后（大小限制由调用方负责）
pub fn compose_query(query: &str, attachment: Option<&str>) -> String {
    match attachment.map(str::trim) {
        Some(doc) if !doc.is_empty() => format!(
            "{query}\n\n--- Attached document ---\n{doc}\n--- End of attached document ---"
        ),
        _ => query.to_string(),
    }
}

/// 预构建的 Agent：可多会话复用
pub struct Agent {
    pub(crate) planner: Planner,
    pub(crate) selector: ActionSelector,
    pub(crate) validator: Validator,
    pub(crate) synthesizer: Synthesizer,
    pub(crate) executor: ToolExecutor,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) context: ContextManager,
    pub(crate) budget: StepBudget,
    pub(crate) max_corrective_tasks: usize,
    pub(crate) sinks: Vec<Arc<dyn EventSink>>,
    /// 外部关停令牌：取消后当前与之后的会话都会中止
    pub(crate) cancel_token: CancellationToken,
    /// 当前一代会话的令牌（cancel_token 的子令牌）；cancel() 取消它并换上新的一代
    pub(crate) run_token: Mutex<CancellationToken>,
}

impl Agent {
    /// 运行一次会话并返回完整结果（答案、是否部分、事件、任务、步数）
    pub async fn run(&self, query: &str) -> RunOutcome {
        let session = ReactSession::new(
            &self.planner,
            &self.selector,
            &self.validator,
            &self.synthesizer,
            &self.executor,
            &self.recovery,
            &self.context,
            self.current_run_token(),
        )
        .with_budget(self.budget)
        .with_max_corrective_tasks(self.max_corrective_tasks)
        .with_sinks(self.sinks.clone());
        run_session(&session, query).await
    }

    /// 调用边界：查询 + 可选附件 -> 答案字符串
    pub async fn handle(&self, query: &str, attachment: Option<&str>) -> String {
        self.run(&compose_query(query, attachment)).await.answer
    }

    fn current_run_token(&self) -> CancellationToken {
        self.run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 协作式取消进行中的会话（在下一次迭代之间生效）；之后的 run 不受影响
    pub fn cancel(&self) {
        let mut current = self.run_token.lock().unwrap_or_else(PoisonError::into_inner);
        current.cancel();
        *current = self.cancel_token.child_token();
    }

    /// 关停令牌：取消它会中止所有会话，包括之后发起的
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    pub fn budget(&self) -> StepBudget {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_query_labels_attachment() {
        assert_eq!(compose_query("q", None), "q");
        assert_eq!(compose_query("q", Some("  ")), "q");
        let composed = compose_query("Summarize", Some("Discharge note"));
        assert!(composed.starts_with("Summarize\n\n--- Attached document ---\nDischarge note\n"));
        assert!(composed.ends_with("--- End of attached document ---"));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "carrier-pigeon".into();
        assert!(matches!(create_llm_from_config(&cfg), Err(AgentError::ConfigError(_))));
        cfg.llm.provider = "mock".into();
        assert!(create_llm_from_config(&cfg).is_ok());
    }
}
