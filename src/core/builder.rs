//! Agent 构建器：统一的 Agent 初始化逻辑
//!
//! 默认从 AppConfig 创建推理网关与临床工具集；测试可注入任意 LlmClient 与 ToolRegistry。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::orchestrator::{create_llm_from_config, Agent};
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::LlmClient;
use crate::react::{
    ActionSelector, ContextManager, EventSink, JsonlSink, Planner, Synthesizer, TracingSink,
    Validator,
};
use crate::tools::{create_default_registry, ToolExecutor, ToolRegistry};

/// Agent 构建器：统一配置和初始化 Agent 的各个组件
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    registry: Option<ToolRegistry>,
    sinks: Vec<Arc<dyn EventSink>>,
    cancel_token: Option<CancellationToken>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            registry: None,
            sinks: Vec::new(),
            cancel_token: None,
        }
    }

    /// 注入推理客户端（原样使用，不再额外包重试网关）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 注入工具注册表（替代默认临床工具集）
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 追加事件 sink（如 ChannelSink）
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_sinks(&self) -> Vec<Arc<dyn EventSink>> {
        let mut sinks: Vec<Arc<dyn EventSink>> =
            vec![Arc::new(TracingSink::new(self.config.agent.verbose))];
        if let Some(path) = &self.config.agent.debug_log {
            match JsonlSink::open(path) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "debug log disabled"),
            }
        }
        sinks.extend(self.sinks.iter().cloned());
        sinks
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let sinks = self.build_sinks();
        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&self.config)?,
        };
        let registry = match self.registry {
            Some(r) => r,
            None => create_default_registry(
                &self.config.data.fhir_root,
                &self.config.data.image_root,
                llm.clone(),
            )?,
        };
        if registry.is_empty() {
            return Err(AgentError::RegistryError("no tools registered".into()));
        }
        let registry = Arc::new(registry);
        let cancel_token = self.cancel_token.unwrap_or_default();
        tracing::info!(tools = ?registry.tool_names(), "tool registry ready");

        Ok(Agent {
            planner: Planner::new(llm.clone()),
            selector: ActionSelector::new(llm.clone(), registry.clone()),
            validator: Validator::new(llm.clone(), registry.clone()),
            synthesizer: Synthesizer::new(llm),
            executor: ToolExecutor::new(registry),
            recovery: RecoveryEngine::new(),
            context: ContextManager::new(self.config.context.limits()),
            budget: self.config.agent.budget(),
            max_corrective_tasks: self.config.agent.max_corrective_tasks,
            sinks,
            run_token: Mutex::new(cancel_token.child_token()),
            cancel_token,
        })
    }
}
