//! Medster - Rust 临床案例分析智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态机、错误与恢复、Agent 构建与调用边界
//! - **llm**: 推理服务抽象、重试网关与实现（OpenAI 兼容 / Mock）
//! - **react**: Planner、Action Selector、Validator、Synthesizer、编排主循环、上下文预算与重复检测
//! - **tools**: 工具注册表与执行器，以及 FHIR 数据 / 队列检索 / 评分 / 影像分析工具
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{Agent, AgentBuilder};
pub use crate::react::RunOutcome;
