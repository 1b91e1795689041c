//! Agent 数据模型：步信息、模型输出、动作与结果、环境快照、运行历史

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::TerminalState;

/// 每步的任务上下文；只由所属 Agent 修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step_number: usize,
    pub max_steps: usize,
    pub task: String,
    /// 附加提示（可选）
    pub add_infos: String,
    /// 跨步累积的重要内容
    pub memory: String,
    pub task_progress: String,
    pub future_plans: String,
}

impl StepInfo {
    pub fn new(task: impl Into<String>, add_infos: impl Into<String>, max_steps: usize) -> Self {
        Self {
            step_number: 1,
            max_steps,
            task: task.into(),
            add_infos: add_infos.into(),
            memory: String::new(),
            task_progress: String::new(),
            future_plans: String::new(),
        }
    }

    /// 成功完成一步后更新：步号加一，累积 important_contents，覆盖进度与计划。
    /// 含 "None" 的字段视为模型未给出内容。
    pub fn update(&mut self, brain: &AgentBrain) {
        self.step_number += 1;

        let important = brain.important_contents.as_str();
        if !important.is_empty() && !important.contains("None") && !self.memory.contains(important) {
            self.memory.push_str(important);
            self.memory.push('\n');
        }
        if !brain.task_progress.is_empty() && !brain.task_progress.contains("None") {
            self.task_progress = brain.task_progress.clone();
        }
        if !brain.future_plans.is_empty() && !brain.future_plans.contains("None") {
            self.future_plans = brain.future_plans.clone();
        }
    }
}

/// 模型对当前状态的六段式评估；缺失或 null 的字段为空字符串
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBrain {
    #[serde(default, deserialize_with = "lenient_string")]
    pub prev_action_evaluation: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub important_contents: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub task_progress: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub future_plans: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub thought: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub summary: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// 单个动作：序列化为 `{"<name>": {<params>}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionModel {
    pub name: String,
    pub params: Map<String, Value>,
}

impl ActionModel {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// 无参数动作
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Map::new())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// 紧凑 JSON 形式，用于日志与失败描述
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.name.clone())
    }
}

impl Serialize for ActionModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.params)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActionModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(serde::de::Error::custom(format!(
                "action must have exactly one name, got {}",
                map.len()
            )));
        }
        let Some((name, params)) = map.into_iter().next() else {
            return Err(serde::de::Error::custom("empty action"));
        };
        let params = match params {
            Value::Object(obj) => obj,
            Value::Null => Map::new(),
            other => {
                let mut obj = Map::new();
                obj.insert("value".to_string(), other);
                obj
            }
        };
        Ok(ActionModel { name, params })
    }
}

/// 模型单步输出：current_state + action 列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub current_state: AgentBrain,
    pub action: Vec<ActionModel>,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub extracted_content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub include_in_memory: bool,
}

impl Default for ActionResult {
    fn default() -> Self {
        Self {
            extracted_content: None,
            error: None,
            is_done: false,
            include_in_memory: false,
        }
    }
}

impl ActionResult {
    /// 普通成功结果
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            extracted_content: Some(text.into()),
            include_in_memory: true,
            ..Self::default()
        }
    }

    /// 终止结果
    pub fn done(text: Option<String>) -> Self {
        Self {
            extracted_content: text,
            is_done: true,
            include_in_memory: true,
            ..Self::default()
        }
    }

    /// 失败结果（保留在对话记忆中）
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            include_in_memory: true,
            ..Self::default()
        }
    }
}

/// 环境快照（对 Agent 不透明，仅用于渲染状态提示与记录历史）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub tabs: Vec<String>,
    /// 页面可读内容 / 可交互元素的文本表示
    #[serde(default)]
    pub content: String,
    /// base64 PNG 截图
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// 历史中的一步
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHistoryItem {
    pub model_output: Option<AgentOutput>,
    pub state: EnvironmentState,
    pub result: Vec<ActionResult>,
}

/// 只追加的运行历史，附带终态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHistory {
    pub history: Vec<AgentHistoryItem>,
    pub outcome: Option<TerminalState>,
}

impl AgentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: AgentHistoryItem) {
        self.history.push(item);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// 最后一条的最后一个结果是否为 is_done
    pub fn is_done(&self) -> bool {
        self.last_result().map(|r| r.is_done).unwrap_or(false)
    }

    pub fn last_result(&self) -> Option<&ActionResult> {
        self.history.last().and_then(|item| item.result.last())
    }

    pub(crate) fn last_result_mut(&mut self) -> Option<&mut ActionResult> {
        self.history.last_mut().and_then(|item| item.result.last_mut())
    }

    /// 最终提取内容
    pub fn final_result(&self) -> Option<String> {
        self.last_result().and_then(|r| r.extracted_content.clone())
    }

    /// 每步的错误（无错误的步为 None）
    pub fn errors(&self) -> Vec<Option<String>> {
        self.history
            .iter()
            .map(|item| item.result.iter().find_map(|r| r.error.clone()))
            .collect()
    }
}
