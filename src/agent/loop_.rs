//! Agent 主循环
//!
//! 每步：observe -> 追加状态消息 -> 调用模型 -> 解析 -> 执行动作 -> 追加历史。
//! 步与步严格串行；停止信号只在步边界检查；解析 / 模型 / 环境错误回滚本步消息后按固定间隔重试，
//! 连续失败达到 max_failures 时以 Failed 终态结束（不抛出）。
//! 模型回复、步号与记忆只在动作执行成功后才提交。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::events::AgentEvent;
use crate::agent::message_manager::{MessageManager, MessageManagerSettings};
use crate::agent::parser::ResponseParser;
use crate::agent::prompts::{PromptBuilders, SystemPromptContext};
use crate::agent::transcript::ConversationRecorder;
use crate::agent::validator::DoneValidator;
use crate::agent::views::{
    ActionModel, ActionResult, AgentHistory, AgentHistoryItem, AgentOutput, EnvironmentState, StepInfo,
};
use crate::core::{AgentError, AgentPhase, RecoveryAction, RecoveryEngine, TerminalState};
use crate::environment::Environment;
use crate::llm::LlmClient;
use crate::memory::{TokenEstimator, Tokenizer};

/// 结果中含此标记的内容会被累积，作为最终输出的首选
const EXTRACTED_MARKER: &str = "Extracted page";

/// 单个 Agent 的运行参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// 连续失败上限
    pub max_failures: usize,
    /// 失败后重试前的固定等待
    pub retry_delay: Duration,
    pub max_actions_per_step: usize,
    /// 写入提示与历史的错误文本最大长度（保留末尾）
    pub max_error_length: usize,
    pub max_input_tokens: usize,
    pub estimated_chars_per_token: usize,
    pub image_tokens: usize,
    pub use_vision: bool,
    pub message_context: Option<String>,
    /// 设置后每次模型调用的输入与输出写入该目录
    pub save_conversation_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_failures: 3,
            retry_delay: Duration::from_secs(20),
            max_actions_per_step: 10,
            max_error_length: 400,
            max_input_tokens: 128_000,
            estimated_chars_per_token: 3,
            image_tokens: 800,
            use_vision: true,
            message_context: None,
            save_conversation_dir: None,
        }
    }
}

impl AgentSettings {
    fn message_settings(&self) -> MessageManagerSettings {
        MessageManagerSettings {
            max_input_tokens: self.max_input_tokens,
            max_error_length: self.max_error_length,
            use_vision: self.use_vision,
            message_context: self.message_context.clone(),
        }
    }
}

/// 单任务 Agent：持有模型、环境与配置；每次 run 使用全新的对话与历史
pub struct Agent {
    task: String,
    add_infos: String,
    llm: Arc<dyn LlmClient>,
    env: Arc<dyn Environment>,
    settings: AgentSettings,
    prompts: PromptBuilders,
    parser: ResponseParser,
    recovery: RecoveryEngine,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    initial_actions: Vec<ActionModel>,
    validator: Option<Arc<dyn DoneValidator>>,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

/// 单次 run 的可变状态
struct RunState {
    messages: MessageManager,
    step_info: StepInfo,
    phase: AgentPhase,
    consecutive_failures: usize,
    /// 最近一次成功观察到的状态（停止时用于合成历史）
    last_state: Option<EnvironmentState>,
    last_actions: Vec<ActionModel>,
    last_results: Vec<ActionResult>,
    extracted_content: String,
    /// 当前步已得到的状态与模型输出（失败时写入历史）
    step_state: Option<EnvironmentState>,
    step_output: Option<AgentOutput>,
    recorder: Option<ConversationRecorder>,
    history: AgentHistory,
}

impl RunState {
    fn transition(&mut self, next: AgentPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(from = ?self.phase, to = ?next, "unexpected agent phase transition");
        }
        self.phase = next;
    }

    /// 完成内容：累积的提取内容优先，否则为记忆
    fn final_content(&self) -> String {
        if self.extracted_content.is_empty() {
            self.step_info.memory.clone()
        } else {
            self.extracted_content.clone()
        }
    }
}

impl Agent {
    pub fn new(task: impl Into<String>, llm: Arc<dyn LlmClient>, env: Arc<dyn Environment>) -> Self {
        let settings = AgentSettings::default();
        Self {
            task: task.into(),
            add_infos: String::new(),
            llm,
            env,
            parser: ResponseParser::new(settings.max_actions_per_step),
            settings,
            prompts: PromptBuilders::default(),
            recovery: RecoveryEngine::new(),
            tokenizer: None,
            initial_actions: Vec::new(),
            validator: None,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.parser = ResponseParser::new(settings.max_actions_per_step);
        self.settings = settings;
        self
    }

    /// 附加提示（写入状态提示的 Hints）
    pub fn with_add_infos(mut self, add_infos: impl Into<String>) -> Self {
        self.add_infos = add_infos.into();
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilders) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// 第一步之前执行一次的动作，其结果作为首个状态提示中的「上一步结果」
    pub fn with_initial_actions(mut self, actions: Vec<ActionModel>) -> Self {
        self.initial_actions = actions;
        self
    }

    /// done 之后（且仍有剩余步数时）校验结果，拒绝则继续执行
    pub fn with_done_validator(mut self, validator: Arc<dyn DoneValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn new_run_state(&self, max_steps: usize) -> RunState {
        let action_descriptions = self.env.action_descriptions();
        let system_prompt = (self.prompts.system)(&SystemPromptContext {
            action_descriptions: &action_descriptions,
            max_actions_per_step: self.settings.max_actions_per_step,
        });
        let mut estimator =
            TokenEstimator::new(self.settings.estimated_chars_per_token, self.settings.image_tokens);
        if let Some(tokenizer) = &self.tokenizer {
            estimator = estimator.with_tokenizer(tokenizer.clone());
        }
        RunState {
            messages: MessageManager::new(
                system_prompt,
                self.settings.message_settings(),
                estimator,
                self.prompts.state.clone(),
            ),
            step_info: StepInfo::new(self.task.as_str(), self.add_infos.as_str(), max_steps),
            phase: AgentPhase::Idle,
            consecutive_failures: 0,
            last_state: None,
            last_actions: Vec::new(),
            last_results: Vec::new(),
            extracted_content: String::new(),
            step_state: None,
            step_output: None,
            recorder: self.settings.save_conversation_dir.as_ref().map(ConversationRecorder::new),
            history: AgentHistory::new(),
        }
    }

    /// 运行任务直至 Done / Stopped / MaxStepsReached / Failed；终态写入 AgentHistory::outcome
    pub async fn run(&self, max_steps: usize) -> AgentHistory {
        info!(task = %self.task, max_steps, model = self.llm.model_name(), "🚀 Starting task");
        let mut run = self.new_run_state(max_steps);

        if !self.initial_actions.is_empty() {
            match self.env.execute(&self.initial_actions).await {
                Ok(mut results) => {
                    pad_stalled_results(&self.initial_actions, &mut results);
                    run.last_actions = self.initial_actions.clone();
                    run.last_results = results;
                }
                Err(e) => warn!(error = %e, "initial actions failed"),
            }
        }

        for i in 0..max_steps {
            if self.cancel_token.is_cancelled() {
                info!("🛑 Stop requested");
                run.transition(AgentPhase::Stopped);
                let state = run.last_state.clone().unwrap_or_default();
                run.history.push(AgentHistoryItem {
                    model_output: None,
                    state,
                    result: vec![ActionResult::done(None)],
                });
                return self.finish(run, TerminalState::Stopped);
            }

            run.transition(AgentPhase::Running);
            let step = run.step_info.step_number;
            self.emit(AgentEvent::StepStarted { step, max_steps });

            match self.step(&mut run).await {
                Ok(()) => {
                    run.transition(AgentPhase::StepOk);
                    if run.history.is_done() {
                        if i + 1 < max_steps && !self.accept_result(&mut run).await {
                            continue;
                        }
                        run.transition(AgentPhase::Done);
                        return self.finish(run, TerminalState::Done);
                    }
                }
                Err(err) => {
                    run.transition(AgentPhase::StepFailed);
                    let action = self.recovery.handle(&err);
                    let message = err.truncated(self.settings.max_error_length);
                    run.consecutive_failures += 1;
                    warn!(
                        step,
                        error = %message,
                        consecutive_failures = run.consecutive_failures,
                        "❌ Step failed"
                    );
                    self.emit(AgentEvent::StepFailed {
                        step,
                        error: message.clone(),
                        consecutive_failures: run.consecutive_failures,
                    });

                    let result = vec![ActionResult::failure(message.clone())];
                    run.last_actions.clear();
                    run.last_results = result.clone();
                    let item = AgentHistoryItem {
                        model_output: run.step_output.take(),
                        state: run.step_state.take().unwrap_or_default(),
                        result,
                    };
                    run.history.push(item);

                    if action == RecoveryAction::Abort
                        || run.consecutive_failures >= self.settings.max_failures
                    {
                        run.transition(AgentPhase::Failed);
                        return self.finish(run, TerminalState::Failed { error: message });
                    }
                    if !self.settings.retry_delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.settings.retry_delay) => {}
                            _ = self.cancel_token.cancelled() => {}
                        }
                    }
                }
            }
        }

        info!("❌ Failed to complete task in maximum steps");
        let content = run.final_content();
        if let Some(last) = run.history.last_result_mut() {
            last.extracted_content = Some(content);
        }
        run.transition(AgentPhase::MaxStepsReached);
        self.finish(run, TerminalState::MaxStepsReached)
    }

    fn finish(&self, mut run: RunState, outcome: TerminalState) -> AgentHistory {
        info!(
            outcome = ?outcome,
            steps = run.history.len(),
            final_result = run.history.final_result().as_deref().unwrap_or(""),
            "agent run finished"
        );
        self.emit(AgentEvent::Finished {
            outcome: outcome.clone(),
        });
        run.history.outcome = Some(outcome);
        run.history
    }

    /// 无校验器时总是接受；校验器出错时记日志并接受
    async fn accept_result(&self, run: &mut RunState) -> bool {
        let Some(validator) = &self.validator else {
            return true;
        };
        let result = run.history.final_result().unwrap_or_default();
        match validator.validate(&self.task, &result).await {
            Ok(None) => {
                info!("✅ Validator accepted the result");
                true
            }
            Ok(Some(reason)) => {
                info!("❌ Validator decision: {}", reason);
                run.last_results = vec![ActionResult::failure(format!(
                    "The output is not yet correct. {}.",
                    reason
                ))];
                false
            }
            Err(e) => {
                warn!(error = %e, "result validation failed, accepting result");
                true
            }
        }
    }

    async fn step(&self, run: &mut RunState) -> Result<(), AgentError> {
        run.step_state = None;
        run.step_output = None;
        let step = run.step_info.step_number;
        info!("📍 Step {}", step);

        let state = self.env.observe().await?;
        run.last_state = Some(state.clone());
        run.messages
            .add_state_message(&state, &run.last_actions, &run.last_results, Some(&run.step_info));
        run.step_state = Some(state);

        let output = match self.next_action(&run.messages).await {
            Ok(output) => output,
            Err(e) => {
                run.messages.remove_state_message_by_index(1);
                return Err(e);
            }
        };
        if let Some(recorder) = run.recorder.as_mut() {
            recorder.save(step, &run.messages.messages(), &output).await;
        }
        log_response(&output);
        self.emit(AgentEvent::ModelOutput {
            step,
            brain: output.current_state.clone(),
            actions: output.action.clone(),
        });
        let actions = output.action.clone();
        run.step_output = Some(output.clone());

        let executed = if actions.is_empty() {
            None
        } else {
            match self.env.execute(&actions).await {
                Ok(mut results) => {
                    pad_stalled_results(&actions, &mut results);
                    Some(results)
                }
                Err(e) => {
                    run.messages.remove_state_message_by_index(1);
                    return Err(e);
                }
            }
        };

        run.messages.add_model_output(&output);
        // 模型回复后状态消息即冗余
        run.messages.remove_state_message_by_index(1);
        run.step_info.update(&output.current_state);
        debug!(memory = %run.step_info.memory, "🧠 All Memory");

        let mut results =
            executed.unwrap_or_else(|| vec![ActionResult::done(Some(run.step_info.memory.clone()))]);

        for content in results.iter().filter_map(|r| r.extracted_content.as_deref()) {
            if content.contains(EXTRACTED_MARKER) {
                run.extracted_content.push_str(content);
            }
        }
        if let Some(last) = results.last_mut() {
            if last.is_done {
                if last.extracted_content.as_deref().map_or(true, str::is_empty) {
                    last.extracted_content = Some(run.final_content());
                }
                info!("📄 Result: {}", last.extracted_content.as_deref().unwrap_or(""));
            }
        }

        self.emit(AgentEvent::ActionResults {
            step,
            results: results.clone(),
        });
        run.last_actions = actions;
        run.last_results = results.clone();
        run.consecutive_failures = 0;
        let item = AgentHistoryItem {
            model_output: run.step_output.take(),
            state: run.step_state.take().unwrap_or_default(),
            result: results,
        };
        run.history.push(item);
        Ok(())
    }

    async fn next_action(&self, messages: &MessageManager) -> Result<AgentOutput, AgentError> {
        let input = messages.messages();
        debug!(messages = input.len(), tokens = messages.total_tokens(), "invoking model");
        let raw = self.llm.complete(&input).await?;
        self.parser.parse(&raw)
    }
}

/// 环境返回的结果少于动作数时，为每个未执行的动作补一条失败结果，指明停顿位置
fn pad_stalled_results(actions: &[ActionModel], results: &mut Vec<ActionResult>) {
    let executed = results.len();
    if executed >= actions.len() {
        return;
    }
    let stall_point = match executed.checked_sub(1).and_then(|i| actions.get(i)) {
        Some(prev) => format!("after action {} {}", executed, prev.to_json()),
        None => "before action 1".to_string(),
    };
    for (i, action) in actions.iter().enumerate().skip(executed) {
        results.push(ActionResult::failure(format!(
            "action {} {} failed to execute. Something new appeared {}",
            i + 1,
            action.to_json(),
            stall_point
        )));
    }
}

fn log_response(output: &AgentOutput) {
    let brain = &output.current_state;
    let emoji = if brain.prev_action_evaluation.contains("Success") {
        "✅"
    } else if brain.prev_action_evaluation.contains("Failed") {
        "❌"
    } else {
        "🤷"
    };
    info!("{} Eval: {}", emoji, brain.prev_action_evaluation);
    info!("🧠 New Memory: {}", brain.important_contents);
    info!("⏳ Task Progress: {}", brain.task_progress);
    info!("📋 Future Plans: {}", brain.future_plans);
    info!("🤔 Thought: {}", brain.thought);
    info!("🎯 Summary: {}", brain.summary);
    for (i, action) in output.action.iter().enumerate() {
        info!("🛠️  Action {}/{}: {}", i + 1, output.action.len(), action.to_json());
    }
}
