//! LLM 客户端抽象与推理网关
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；
//! RetryingLlmClient 包装任意后端，提供有界重试 + 指数退避，并通过可插拔的分类函数区分可重试 / 终止性错误。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::types::{LlmRequest, LlmResponse};

/// 推理服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// 请求本身不合法（如 schema 格式错误），重试无意义
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// 默认分类：超时、限流、5xx、网络抖动可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
                | LlmError::Network(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LlmError::Auth(_) | LlmError::InvalidRequest(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置：最多 max_attempts 次，首次退避 initial_delay，每次乘以 multiplier
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后（从 1 开始）的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// 错误分类函数：返回 true 表示可重试
pub type RetryClassifier = Arc<dyn Fn(&LlmError) -> bool + Send + Sync>;

/// 推理网关：对内层客户端做有界重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
    classify: RetryClassifier,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            classify: Arc::new(LlmError::is_retryable),
        }
    }

    /// 替换默认的可重试判定
    pub fn with_classifier(mut self, classify: RetryClassifier) -> Self {
        self.classify = classify;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if !(self.classify)(&e) => {
                    tracing::warn!(purpose = ?request.purpose, error = %e, "reasoning call failed (terminal)");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(purpose = ?request.purpose, attempts = attempt, error = %e, "reasoning call retries exhausted");
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Duration::from_millis(*ms).max(self.config.delay_for(attempt)),
                        _ => self.config.delay_for(attempt),
                    };
                    tracing::info!(
                        purpose = ?request.purpose,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying reasoning call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
