//! 会话状态：阶段状态机、任务列表、步数预算
//!
//! SessionState 只由编排循环修改；子组件（Planner / Selector / Validator）只读。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 编排阶段
///
/// ```text
/// Planning → TaskActive
/// TaskActive → TaskValidating | TaskActive | MetaValidating | Aborted
/// TaskValidating → TaskActive | MetaValidating | Aborted
/// MetaValidating → TaskActive | Synthesizing | Aborted
/// Synthesizing → Done
/// Aborted → Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    TaskActive,
    TaskValidating,
    MetaValidating,
    Synthesizing,
    /// 全局步数耗尽、终止性错误或取消；仍会调用 Synthesizer 给出部分答案
    Aborted,
    Done,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done)
    }

    /// 合法转移表；Aborted 可从任意非终止阶段进入
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        if next == Aborted {
            return !matches!(self, Aborted | Done);
        }
        matches!(
            (self, next),
            (Planning, TaskActive)
                | (TaskActive, TaskValidating)
                | (TaskActive, TaskActive)
                | (TaskActive, MetaValidating)
                | (TaskValidating, TaskActive)
                | (TaskValidating, MetaValidating)
                | (MetaValidating, TaskActive)
                | (MetaValidating, Synthesizing)
                | (Synthesizing, Done)
                | (Aborted, Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Planning => "PLANNING",
            Phase::TaskActive => "TASK_ACTIVE",
            Phase::TaskValidating => "TASK_VALIDATING",
            Phase::MetaValidating => "META_VALIDATING",
            Phase::Synthesizing => "SYNTHESIZING",
            Phase::Aborted => "ABORTED",
            Phase::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Abandoned,
}

/// Planner 拆解出的单个任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: usize,
    pub description: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: usize, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            status: TaskStatus::Pending,
        }
    }
}

/// 进入 ABORTED 的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// 全局步数预算耗尽（正常的终止转移，不是错误）
    BudgetExceeded,
    /// 推理服务终止性错误
    ReasoningRejected(String),
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::BudgetExceeded => write!(f, "global step budget exhausted"),
            AbortReason::ReasoningRejected(msg) => write!(f, "reasoning service rejected request: {msg}"),
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 步数预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub max_steps: usize,
    pub max_steps_per_task: usize,
}

impl Default for StepBudget {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_steps_per_task: 5,
        }
    }
}

/// 单次会话的可变状态：任务列表、当前任务游标、两级步数计数
#[derive(Debug, Clone)]
pub struct SessionState {
    pub tasks: Vec<Task>,
    pub current: usize,
    pub global_step_count: usize,
    pub per_task_step_count: usize,
    pub budget: StepBudget,
}

impl SessionState {
    pub fn new(budget: StepBudget) -> Self {
        Self {
            tasks: Vec::new(),
            current: 0,
            global_step_count: 0,
            per_task_step_count: 0,
            budget,
        }
    }

    pub fn set_tasks(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks;
        self.current = 0;
        self.per_task_step_count = 0;
        if let Some(t) = self.tasks.first_mut() {
            t.status = TaskStatus::InProgress;
        }
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current)
    }

    pub fn global_budget_left(&self) -> bool {
        self.global_step_count < self.budget.max_steps
    }

    pub fn task_budget_left(&self) -> bool {
        self.per_task_step_count < self.budget.max_steps_per_task
    }

    /// 记录一步（调用前须确认两级预算均有余量）
    pub fn record_step(&mut self) {
        debug_assert!(self.global_budget_left() && self.task_budget_left());
        self.global_step_count += 1;
        self.per_task_step_count += 1;
    }

    /// 结束当前任务并推进游标；返回是否还有下一个任务
    pub fn finish_current(&mut self, status: TaskStatus) -> bool {
        if let Some(t) = self.tasks.get_mut(self.current) {
            t.status = status;
        }
        self.current += 1;
        self.per_task_step_count = 0;
        match self.tasks.get_mut(self.current) {
            Some(next) => {
                next.status = TaskStatus::InProgress;
                true
            }
            None => false,
        }
    }

    /// 追加一个纠偏任务并立即激活（META_VALIDATING 判定未回答时使用）
    pub fn push_corrective(&mut self, description: impl Into<String>) {
        let id = self.tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let mut task = Task::new(id, description);
        task.status = TaskStatus::InProgress;
        self.tasks.push(task);
        self.current = self.tasks.len() - 1;
        self.per_task_step_count = 0;
    }

    pub fn any_abandoned(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Abandoned)
    }
}
