//! 编排主循环
//!
//! PLANNING -> TASK_ACTIVE -> TASK_VALIDATING -> (下一任务 | META_VALIDATING) -> SYNTHESIZING -> DONE；
//! 全局步数耗尽、终止性推理错误或取消时进入 ABORTED，仍会合成一个标注为部分答案的回复。
//! 本循环是唯一修改会话状态的组件；子组件只读取状态与证据。

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::core::{
    AbortReason, AgentError, Phase, RecoveryAction, RecoveryEngine, SessionState, StepBudget, Task,
    TaskStatus,
};
use crate::react::context::ContextManager;
use crate::react::events::{Event, EventKind, EventSink, Transcript};
use crate::react::evidence::{Action, EvidenceLog};
use crate::react::loop_guard::{is_repetitive, ActionWindow};
use crate::react::planner::Planner;
use crate::react::prompts::REPETITION_HINT;
use crate::react::selector::{ActionSelector, Selection, SelectionContext};
use crate::react::synthesizer::Synthesizer;
use crate::react::validator::Validator;
use crate::tools::ToolExecutor;

const UNDECODABLE_SELECTION_HINT: &str =
    "The previous reply could not be understood. Respond with exactly one tool call.";
const ABANDONED_NOTICE: &str = "some tasks were abandoned before completion";

/// 一次会话的执行结果
#[derive(Debug)]
pub struct RunOutcome {
    pub answer: String,
    /// 是否为部分答案（ABORTED 或有任务被放弃）
    pub partial: bool,
    pub abort: Option<AbortReason>,
    pub transcript: Vec<Event>,
    pub tasks: Vec<Task>,
    /// 全局步数
    pub steps: usize,
    /// 依次经过的阶段
    pub phases: Vec<Phase>,
}

/// 会话配置：各组件引用 + 预算 + 可选事件 sink
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub selector: &'a ActionSelector,
    pub validator: &'a Validator,
    pub synthesizer: &'a Synthesizer,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub context: &'a ContextManager,
    /// 只在迭代之间检查
    pub cancel_token: CancellationToken,
    pub budget: StepBudget,
    /// META_VALIDATING 最多追加的补救任务数
    pub max_corrective_tasks: usize,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

impl<'a> ReactSession<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: &'a Planner,
        selector: &'a ActionSelector,
        validator: &'a Validator,
        synthesizer: &'a Synthesizer,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        context: &'a ContextManager,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            selector,
            validator,
            synthesizer,
            executor,
            recovery,
            context,
            cancel_token,
            budget: StepBudget::default(),
            max_corrective_tasks: 1,
            sinks: Vec::new(),
        }
    }

    pub fn with_budget(mut self, budget: StepBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_corrective_tasks(mut self, n: usize) -> Self {
        self.max_corrective_tasks = n;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }
}

/// 运行一次完整会话；总是返回答案，从不向调用方抛错
pub async fn run_session(session: &ReactSession<'_>, query: &str) -> RunOutcome {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("session", id = %session_id);
    let run = Run {
        s: session,
        query,
        state: SessionState::new(session.budget),
        log: EvidenceLog::new(),
        window: ActionWindow::new(),
        transcript: Transcript::new(session_id, session.sinks.clone()),
        phase: Phase::Planning,
        phases: vec![Phase::Planning],
        hints: Vec::new(),
        abort: None,
        corrective_left: session.max_corrective_tasks,
    };
    run.drive().instrument(span).await
}

struct Run<'s, 'a> {
    s: &'s ReactSession<'a>,
    query: &'s str,
    state: SessionState,
    log: EvidenceLog,
    window: ActionWindow,
    transcript: Transcript,
    phase: Phase,
    phases: Vec<Phase>,
    /// 回灌给下一次 Action Selector 的提示；任务推进或成功执行后清空
    hints: Vec<String>,
    abort: Option<AbortReason>,
    corrective_left: usize,
}

impl<'s, 'a> Run<'s, 'a> {
    async fn drive(mut self) -> RunOutcome {
        self.transcript.record(
            EventKind::LoopStart,
            json!({
                "query": self.query,
                "max_steps": self.state.budget.max_steps,
                "max_steps_per_task": self.state.budget.max_steps_per_task,
            }),
        );
        tracing::info!(query_chars = self.query.chars().count(), "session started");

        let answer = loop {
            match self.phase {
                Phase::Planning => self.plan().await,
                Phase::TaskActive => self.act().await,
                Phase::TaskValidating => self.validate_task().await,
                Phase::MetaValidating => self.validate_session().await,
                Phase::Synthesizing | Phase::Aborted => {
                    let answer = self.synthesize().await;
                    self.advance(Phase::Done);
                    break answer;
                }
                Phase::Done => break String::new(),
            }
        };

        let partial = self.abort.is_some() || self.state.any_abandoned();
        self.transcript.record(
            EventKind::LoopEnd,
            json!({
                "steps": self.state.global_step_count,
                "tasks": self.state.tasks.len(),
                "partial": partial,
                "abort": self.abort,
            }),
        );
        tracing::info!(steps = self.state.global_step_count, partial, "session finished");

        RunOutcome {
            answer,
            partial,
            abort: self.abort,
            transcript: self.transcript.into_events(),
            tasks: self.state.tasks,
            steps: self.state.global_step_count,
            phases: self.phases,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        tracing::debug!(from = %self.phase, to = %next, "phase");
        self.phase = next;
        self.phases.push(next);
    }

    fn abort(&mut self, reason: AbortReason) {
        tracing::warn!(reason = %reason, "session aborted");
        if let Some(t) = self.state.tasks.get_mut(self.state.current) {
            if t.status == TaskStatus::InProgress {
                t.status = TaskStatus::Abandoned;
            }
        }
        self.log.close_task();
        self.abort = Some(reason);
        self.advance(Phase::Aborted);
    }

    /// 结束当前任务并推进到下一个（或进入 META_VALIDATING）
    fn finish_task(&mut self, status: TaskStatus) {
        if let Some(t) = self.state.current_task() {
            if status == TaskStatus::Abandoned {
                tracing::warn!(task = t.id, steps = self.state.per_task_step_count, "task abandoned");
            } else {
                tracing::info!(task = t.id, steps = self.state.per_task_step_count, "task done");
            }
        }
        self.log.close_task();
        self.hints.clear();
        let next = if self.state.finish_current(status) {
            Phase::TaskActive
        } else {
            Phase::MetaValidating
        };
        self.advance(next);
    }

    fn evidence(&self, protect_task: Option<usize>) -> String {
        self.s
            .context
            .render_evidence(&self.state.tasks, &self.log.all(), protect_task)
            .text
    }

    async fn plan(&mut self) {
        let tasks = match self.s.planner.plan(self.query, &mut self.transcript).await {
            Ok(tasks) if !tasks.is_empty() => tasks,
            Ok(_) => Planner::fallback(self.query),
            Err(e) => match self.s.recovery.handle(&e) {
                RecoveryAction::Abort => {
                    self.abort(AbortReason::ReasoningRejected(e.to_string()));
                    return;
                }
                _ => {
                    tracing::warn!(error = %e, "planning failed, using single-task plan");
                    Planner::fallback(self.query)
                }
            },
        };
        self.state.set_tasks(tasks);
        self.advance(Phase::TaskActive);
    }

    async fn choose(&mut self, task: &Task) -> Result<Selection, AgentError> {
        let evidence = self.evidence(Some(task.id));
        let ctx = SelectionContext {
            query: self.query,
            task,
            evidence: &evidence,
            log: &self.log,
            recent: &self.window,
            hints: &self.hints,
        };
        self.s.selector.select(&ctx, &mut self.transcript).await
    }

    fn on_selection_error(&mut self, e: AgentError) {
        match self.s.recovery.handle(&e) {
            RecoveryAction::Abort => self.abort(AbortReason::ReasoningRejected(e.to_string())),
            RecoveryAction::AbandonTask => {
                tracing::warn!(error = %e, "action selection unavailable");
                self.finish_task(TaskStatus::Abandoned);
            }
            RecoveryAction::Degrade => {
                tracing::warn!(error = %e, "action selection undecodable");
                self.state.record_step();
                self.hints.push(UNDECODABLE_SELECTION_HINT.to_string());
                self.advance(Phase::TaskActive);
            }
        }
    }

    async fn act(&mut self) {
        if self.s.cancel_token.is_cancelled() {
            self.abort(AbortReason::Cancelled);
            return;
        }
        if !self.state.global_budget_left() {
            self.abort(AbortReason::BudgetExceeded);
            return;
        }
        if !self.state.task_budget_left() {
            self.finish_task(TaskStatus::Abandoned);
            return;
        }
        let Some(task) = self.state.current_task().cloned() else {
            self.advance(Phase::MetaValidating);
            return;
        };

        let first = match self.choose(&task).await {
            Ok(s) => s,
            Err(e) => return self.on_selection_error(e),
        };
        let selection = match first {
            Selection::Action(a) if is_repetitive(&self.window, &a) => {
                self.transcript.record(
                    EventKind::Error,
                    json!({"loop_guard": "repetitive", "tool": a.tool_name, "arguments": a.arguments}),
                );
                self.hints.push(REPETITION_HINT.to_string());
                match self.choose(&task).await {
                    Ok(Selection::Action(b)) if is_repetitive(&self.window, &b) => {
                        tracing::warn!(task = task.id, tool = %b.tool_name, "still repetitive after hint");
                        self.finish_task(TaskStatus::Abandoned);
                        return;
                    }
                    Ok(s) => s,
                    Err(e) => return self.on_selection_error(e),
                }
            }
            s => s,
        };

        self.state.record_step();
        self.hints.clear();
        match selection {
            Selection::NoAction(text) => {
                tracing::debug!(task = task.id, reply_chars = text.chars().count(), "no further action proposed");
            }
            Selection::Action(action) => self.execute(task.id, action).await,
        }
        self.advance(Phase::TaskValidating);
    }

    async fn execute(&mut self, task_id: usize, action: Action) {
        self.transcript.record(
            EventKind::ToolCall,
            json!({"task_id": task_id, "tool": action.tool_name, "arguments": action.arguments}),
        );
        let outcome = self
            .s
            .executor
            .execute(&action.tool_name, action.arguments.clone())
            .await;
        let output = self.log.record(task_id, &action, outcome);
        let payload = json!({
            "task_id": task_id,
            "tool": output.tool_name,
            "sequence_index": output.sequence_index,
            "ok": !output.is_error(),
            "result": output.result,
            "error": output.error,
        });
        self.transcript.record(EventKind::ToolResult, payload);
        self.window.push(action);
    }

    async fn validate_task(&mut self) {
        let Some(task) = self.state.current_task().cloned() else {
            self.advance(Phase::MetaValidating);
            return;
        };
        let evidence = self.evidence(Some(task.id));
        let result = self
            .s
            .validator
            .validate_task(self.query, &task, &self.log, &evidence, &mut self.transcript)
            .await;
        match result {
            Ok(check) if check.verdict.done => {
                tracing::info!(task = task.id, reason = %check.verdict.reason, "task validated");
                self.finish_task(TaskStatus::Done);
            }
            Ok(check) => {
                tracing::info!(task = task.id, reason = %check.verdict.reason, "task not done");
                if let Some(hint) = check.hint {
                    self.hints.push(hint);
                }
                if self.state.task_budget_left() {
                    self.advance(Phase::TaskActive);
                } else {
                    self.finish_task(TaskStatus::Abandoned);
                }
            }
            Err(e) => match self.s.recovery.handle(&e) {
                RecoveryAction::Abort => self.abort(AbortReason::ReasoningRejected(e.to_string())),
                RecoveryAction::AbandonTask => self.finish_task(TaskStatus::Abandoned),
                RecoveryAction::Degrade => {
                    tracing::warn!(task = task.id, error = %e, "validation_skipped");
                    self.finish_task(TaskStatus::Done);
                }
            },
        }
    }

    async fn validate_session(&mut self) {
        if self.s.cancel_token.is_cancelled() {
            self.abort(AbortReason::Cancelled);
            return;
        }
        let evidence = self.evidence(None);
        let result = self
            .s
            .validator
            .validate_session(self.query, &evidence, &mut self.transcript)
            .await;
        match result {
            Ok(v) if !v.answered && self.corrective_left > 0 && self.state.global_budget_left() => {
                let description = v.missing.unwrap_or_else(|| {
                    format!("Gather the information still missing to answer: {}", self.query)
                });
                tracing::info!(task = %description, "adding corrective task");
                self.corrective_left -= 1;
                self.state.push_corrective(description);
                self.advance(Phase::TaskActive);
            }
            Ok(_) => self.advance(Phase::Synthesizing),
            Err(e) => match self.s.recovery.handle(&e) {
                RecoveryAction::Abort => self.abort(AbortReason::ReasoningRejected(e.to_string())),
                _ => {
                    tracing::warn!(error = %e, "session validation skipped");
                    self.advance(Phase::Synthesizing);
                }
            },
        }
    }

    async fn synthesize(&mut self) -> String {
        let partial = match &self.abort {
            Some(reason) => Some(reason.to_string()),
            None if self.state.any_abandoned() => Some(ABANDONED_NOTICE.to_string()),
            None => None,
        };
        let outputs = self.log.all();
        let evidence = self
            .s
            .context
            .render_evidence(&self.state.tasks, &outputs, None)
            .text;
        self.s
            .synthesizer
            .synthesize(
                self.query,
                &evidence,
                &outputs,
                partial.as_deref(),
                &mut self.transcript,
            )
            .await
    }
}
