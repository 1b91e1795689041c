//! 模型输出解析与校验
//!
//! 原始文本 -> 去围栏 -> JSON 修复 -> 解码 -> 校验 `current_state` / `action` -> 截断动作数。
//! 解析失败返回 AgentError::JsonParseError，由主循环按步重试，不会中止进程。

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agent::repair::repair_json;
use crate::agent::views::AgentOutput;
use crate::core::AgentError;

/// 原文预览最大字符数（写入错误信息）
const RAW_PREVIEW_CHARS: usize = 200;

fn preview(raw: &str) -> String {
    let p: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
    if raw.chars().count() > RAW_PREVIEW_CHARS {
        format!("{}...", p)
    } else {
        p
    }
}

/// 修复并解码为 JSON 对象
pub fn parse_json_object(raw: &str) -> Result<serde_json::Map<String, Value>, AgentError> {
    let repaired = repair_json(raw);
    let value: Value = serde_json::from_str(&repaired)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, preview(raw))))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(AgentError::JsonParseError(format!(
            "expected a JSON object, got {}: {}",
            json_type(&other),
            preview(raw)
        ))),
    }
}

/// 修复后按任意 schema 解码（研究编排器的查询计划等）
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, AgentError> {
    let map = parse_json_object(raw)?;
    serde_json::from_value(Value::Object(map))
        .map_err(|e| AgentError::JsonParseError(format!("schema mismatch: {}: {}", e, preview(raw))))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Agent 输出解析器
#[derive(Debug, Clone)]
pub struct ResponseParser {
    max_actions_per_step: usize,
}

impl ResponseParser {
    pub fn new(max_actions_per_step: usize) -> Self {
        Self { max_actions_per_step }
    }

    pub fn parse(&self, raw: &str) -> Result<AgentOutput, AgentError> {
        let map = parse_json_object(raw)?;

        match map.get("current_state") {
            Some(Value::Object(_)) => {}
            Some(other) => {
                return Err(AgentError::JsonParseError(format!(
                    "`current_state` must be an object, got {}",
                    json_type(other)
                )))
            }
            None => return Err(AgentError::JsonParseError("missing `current_state`".to_string())),
        }
        match map.get("action") {
            Some(Value::Array(_)) => {}
            Some(other) => {
                return Err(AgentError::JsonParseError(format!(
                    "`action` must be a list, got {}",
                    json_type(other)
                )))
            }
            None => return Err(AgentError::JsonParseError("missing `action`".to_string())),
        }

        let mut output: AgentOutput = serde_json::from_value(Value::Object(map))
            .map_err(|e| AgentError::JsonParseError(format!("schema mismatch: {}", e)))?;

        if output.action.len() > self.max_actions_per_step {
            tracing::debug!(
                requested = output.action.len(),
                kept = self.max_actions_per_step,
                "truncating actions"
            );
            output.action.truncate(self.max_actions_per_step);
        }
        Ok(output)
    }
}
