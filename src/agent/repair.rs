//! 模型输出 JSON 容错修复
//!
//! 逐字符扫描一次，按固定规则修复常见畸形，不改变语义：
//! 1. 去掉包裹整段输出的 markdown 代码围栏（首行 ```lang、末尾 ```），正文中的 ``` 保留
//! 2. 截掉最外层对象（无对象时为数组）前后的说明文字
//! 3. 单引号字符串转为双引号
//! 4. 给裸键名加引号
//! 5. 裸词值：True/False/None 转为 JSON 字面量，其余加引号
//! 6. 删除 `}` / `]` 前的多余逗号
//! 7. 转义字符串中的原始换行、制表符与非法反斜杠
//! 8. 补全未闭合的字符串与括号（输出被截断时）
//!
//! 合法 JSON 原样通过。

/// 去除首尾的代码围栏：开头的 ```lang 行与结尾的 ```
pub fn strip_code_fences(text: &str) -> String {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = match rest.find('\n') {
            Some(i) => &rest[i + 1..],
            None => rest,
        };
    }
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// 修复模型输出为可解析的 JSON 文本；找不到对象或数组时返回去围栏后的原文
pub fn repair_json(raw: &str) -> String {
    let text = strip_code_fences(raw);
    // 顶层期望对象；没有对象时才退回数组
    let Some(start) = text.find('{').or_else(|| text.find('[')) else {
        return text;
    };
    Repairer::new(&text[start..]).run()
}

struct Repairer {
    chars: Vec<char>,
    pos: usize,
    out: String,
    /// 期望的闭合符号栈
    stack: Vec<char>,
}

impl Repairer {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            out: String::with_capacity(text.len() + 8),
            stack: Vec::new(),
        }
    }

    fn run(mut self) -> String {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            match c {
                '"' | '\'' => self.read_string(c),
                '{' => {
                    self.stack.push('}');
                    self.out.push(c);
                    self.pos += 1;
                }
                '[' => {
                    self.stack.push(']');
                    self.out.push(c);
                    self.pos += 1;
                }
                '}' | ']' => {
                    self.pos += 1;
                    if !self.stack.contains(&c) {
                        continue;
                    }
                    self.drop_trailing_comma();
                    while let Some(closer) = self.stack.pop() {
                        self.out.push(closer);
                        if closer == c {
                            break;
                        }
                    }
                    if self.stack.is_empty() {
                        // 顶层值结束，丢弃其后的说明文字
                        return self.out;
                    }
                }
                c if c.is_alphabetic() || c == '_' || c == '$' => self.read_bare_word(),
                _ => {
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }
        self.finish()
    }

    fn last_significant(&self) -> Option<char> {
        self.out.chars().rev().find(|c| !c.is_whitespace())
    }

    fn drop_trailing_comma(&mut self) {
        let trimmed_len = self.out.trim_end().len();
        if self.out[..trimmed_len].ends_with(',') {
            self.out.truncate(trimmed_len - 1);
        }
    }

    fn in_object(&self) -> bool {
        self.stack.last() == Some(&'}')
    }

    fn key_position(&self) -> bool {
        self.in_object() && matches!(self.last_significant(), Some('{') | Some(','))
    }

    fn read_string(&mut self, quote: char) {
        self.pos += 1;
        self.out.push('"');
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            self.pos += 1;
            match c {
                '\\' => {
                    let next = self.chars.get(self.pos).copied();
                    match next {
                        Some('\'') => {
                            self.out.push('\'');
                            self.pos += 1;
                        }
                        Some(n) if matches!(n, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                            self.out.push('\\');
                            self.out.push(n);
                            self.pos += 1;
                        }
                        _ => self.out.push_str("\\\\"),
                    }
                }
                c if c == quote => {
                    self.out.push('"');
                    return;
                }
                '"' => self.out.push_str("\\\""),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                c => self.out.push(c),
            }
        }
        // 输入在字符串内结束
        self.out.push('"');
    }

    fn read_bare_word(&mut self) {
        if self.key_position() {
            let start = self.pos;
            while self.pos < self.chars.len() {
                let c = self.chars[self.pos];
                if c.is_alphanumeric() || c == '_' || c == '$' || c == '-' {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            let key: String = self.chars[start..self.pos].iter().collect();
            self.out.push('"');
            self.out.push_str(&key);
            self.out.push('"');
            return;
        }

        let value_position = match self.last_significant() {
            Some(':') => true,
            Some('[') | Some(',') => !self.in_object(),
            _ => false,
        };
        if !value_position {
            self.out.push(self.chars[self.pos]);
            self.pos += 1;
            return;
        }

        let start = self.pos;
        while self.pos < self.chars.len() && !matches!(self.chars[self.pos], ',' | '}' | ']' | '\n') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let word = word.trim_end();
        match word {
            "true" | "True" => self.out.push_str("true"),
            "false" | "False" => self.out.push_str("false"),
            "null" | "None" => self.out.push_str("null"),
            other => {
                self.out.push('"');
                for c in other.chars() {
                    if c == '"' {
                        self.out.push('\\');
                    }
                    self.out.push(c);
                }
                self.out.push('"');
            }
        }
    }

    fn finish(mut self) -> String {
        let trimmed_len = self.out.trim_end().len();
        self.out.truncate(trimmed_len);
        if self.out.ends_with(',') {
            self.out.pop();
        }
        if self.out.ends_with(':') {
            self.out.push_str("null");
        }
        while let Some(closer) = self.stack.pop() {
            self.out.push(closer);
        }
        self.out
    }
}
