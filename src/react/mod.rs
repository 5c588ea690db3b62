//! 认知层：Planner、Action Selector、Validator、Synthesizer、编排主循环，以及证据 / 上下文 / 重复检测

pub mod context;
pub mod events;
pub mod evidence;
pub mod loop_;
pub mod loop_guard;
pub mod planner;
pub mod prompts;
pub mod reasoning;
pub mod selector;
pub mod synthesizer;
pub mod validator;

pub use context::{ContextLimits, ContextManager, RenderedEvidence};
pub use events::{ChannelSink, Event, EventKind, EventSink, JsonlSink, TracingSink, Transcript};
pub use evidence::{Action, EvidenceLog, ToolOutput};
pub use loop_::{run_session, ReactSession, RunOutcome};
pub use loop_guard::{is_repetitive, ActionWindow};
pub use planner::Planner;
pub use selector::{ActionSelector, Selection};
pub use synthesizer::Synthesizer;
pub use validator::{SessionVerdict, Validator, Verdict};
