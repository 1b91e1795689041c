//! 提示词构建
//!
//! 系统提示与状态提示都是注入的闭包（SystemPromptBuilder / StatePromptBuilder），
//! 在构造 Agent 时选定；默认实现见 default_system_prompt / default_state_prompt。

use std::sync::Arc;

use chrono::Local;

use crate::agent::views::{ActionModel, ActionResult, EnvironmentState, StepInfo};
use crate::core::truncate_tail;

/// 系统提示上下文
pub struct SystemPromptContext<'a> {
    /// 环境提供的可用动作说明
    pub action_descriptions: &'a str,
    pub max_actions_per_step: usize,
}

/// 状态提示上下文（每步一条）
pub struct StatePromptContext<'a> {
    pub state: &'a EnvironmentState,
    pub last_actions: &'a [ActionModel],
    pub last_results: &'a [ActionResult],
    pub step_info: Option<&'a StepInfo>,
    pub max_error_length: usize,
}

pub type SystemPromptBuilder = Arc<dyn Fn(&SystemPromptContext<'_>) -> String + Send + Sync>;
pub type StatePromptBuilder = Arc<dyn Fn(&StatePromptContext<'_>) -> String + Send + Sync>;

/// 一对提示词构建策略
#[derive(Clone)]
pub struct PromptBuilders {
    pub system: SystemPromptBuilder,
    pub state: StatePromptBuilder,
}

impl PromptBuilders {
    pub fn new(system: SystemPromptBuilder, state: StatePromptBuilder) -> Self {
        Self { system, state }
    }

    pub fn with_system(mut self, system: SystemPromptBuilder) -> Self {
        self.system = system;
        self
    }

    pub fn with_state(mut self, state: StatePromptBuilder) -> Self {
        self.state = state;
        self
    }
}

impl Default for PromptBuilders {
    fn default() -> Self {
        Self {
            system: Arc::new(default_system_prompt),
            state: Arc::new(default_state_prompt),
        }
    }
}

impl std::fmt::Debug for PromptBuilders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptBuilders").finish_non_exhaustive()
    }
}

const RESPONSE_FORMAT: &str = r#"1. RESPONSE FORMAT: You must ALWAYS respond with valid JSON in this exact format:
   {
     "current_state": {
       "prev_action_evaluation": "Success|Failed|Unknown - Check whether the previous actions achieved their goal. The page is the ground truth. Briefly state why.",
       "important_contents": "Important content on the current page closely related to the task. Empty string if none.",
       "task_progress": "The completed steps, numbered, as one string.",
       "future_plans": "The remaining steps required to complete the task, as one string.",
       "thought": "Reflect on what has been done and what to do next. Include reflection on failed actions.",
       "summary": "A brief description of the next operations."
     },
     "action": [
       {"action_name": {"param": "value"}}
     ]
   }
2. ACTIONS: Actions are executed in the listed order. Only include actions until you expect the page to change.
3. TASK COMPLETION: When every requirement is met, output the done action. Do not hallucinate actions; verify against the page content.
4. ERRORS: If an action failed, try an alternative instead of repeating it."#;

/// 默认系统提示
pub fn default_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    format!(
        "You are a precise task agent operating through an external environment. Your role is to:\n\
         1. Analyze the provided page state.\n\
         2. Plan a sequence of actions to accomplish the task.\n\
         3. Return a valid JSON response as specified, containing your state assessment and planned actions.\n\n\
         INPUT STRUCTURE:\n\
         1. Task: the user's instruction.\n\
         2. Hints (Optional): additional hints.\n\
         3. Memory: important content recorded in previous steps.\n\
         4. Current URL and available tabs.\n\
         5. Page content.\n\n\
         RULES:\n{}\n   - Use at most {} actions per sequence.\n\n\
         Functions:\n{}\n\n\
         Respond strictly in JSON.",
        RESPONSE_FORMAT, ctx.max_actions_per_step, ctx.action_descriptions
    )
}

/// 默认状态提示：步数、时间、任务、记忆、页面状态、上一步动作及结果
pub fn default_state_prompt(ctx: &StatePromptContext<'_>) -> String {
    let mut out = String::new();
    if let Some(info) = ctx.step_info {
        out.push_str(&format!("Current step: {}/{}\n", info.step_number, info.max_steps));
    }
    out.push_str(&format!(
        "Current date and time: {}\n",
        Local::now().format("%Y-%m-%d %H:%M")
    ));

    let (task, hints, memory) = ctx
        .step_info
        .map(|i| (i.task.as_str(), i.add_infos.as_str(), i.memory.as_str()))
        .unwrap_or(("", "", ""));
    let content = if ctx.state.content.trim().is_empty() {
        "empty page"
    } else {
        ctx.state.content.as_str()
    };
    out.push_str(&format!(
        "1. Task: {}\n2. Hints (Optional):\n{}\n3. Memory:\n{}\n4. Current URL: {}\n5. Available tabs:\n{}\n6. Page content:\n{}\n",
        task,
        hints,
        memory,
        ctx.state.url,
        ctx.state.tabs.join("\n"),
        content
    ));

    if !ctx.last_results.is_empty() {
        out.push_str("\n**Previous Actions**\n");
        if let Some(info) = ctx.step_info {
            out.push_str(&format!(
                "Previous step: {}/{}\n",
                info.step_number.saturating_sub(1),
                info.max_steps
            ));
        }
        let total = ctx.last_results.len();
        for (i, result) in ctx.last_results.iter().enumerate() {
            if let Some(action) = ctx.last_actions.get(i) {
                out.push_str(&format!("Previous action {}/{}: {}\n", i + 1, total, action.to_json()));
            }
            if !result.include_in_memory {
                continue;
            }
            if let Some(content) = &result.extracted_content {
                out.push_str(&format!("Result of previous action {}/{}: {}\n", i + 1, total, content));
            }
            if let Some(error) = &result.error {
                out.push_str(&format!(
                    "Error of previous action {}/{}: {}\n",
                    i + 1,
                    total,
                    truncate_tail(error, ctx.max_error_length)
                ));
            }
        }
    }
    out
}
