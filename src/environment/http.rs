//! HTTP 环境：抓取网页并转为可读文本，供 Agent 导航与提取内容
//!
//! 动作：go_to_url / search_web / extract_page_content / done。
//! 域名白名单为空时不限制；GET 请求带超时与 User-Agent；HTML 经 html2text 提取可读文本，
//! 超过 max_content_chars 时截断并追加 ...[truncated]。
//! 导航后页面已变化，同一批次中其后的动作不再执行（由主循环补齐失败结果）。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use tokio::sync::Mutex;

use crate::agent::views::{ActionModel, ActionResult, EnvironmentState};
use crate::core::AgentError;
use crate::environment::{Environment, EnvironmentFactory};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const SEARCH_URL: &str = "https://html.duckduckgo.com/html/?q=";

const ACTION_DESCRIPTIONS: &str = r#"go_to_url: Navigate to a URL. Params: {"url": "https://..."}
search_web: Search the web and open the result page. Params: {"query": "..."}
extract_page_content: Extract the readable text of the current page. Params: {}
done: Finish the task and report the result. Params: {"text": "final answer"}"#;

#[derive(Debug, Clone)]
pub struct HttpEnvironmentConfig {
    pub timeout: Duration,
    pub max_content_chars: usize,
    /// 为空表示不限制
    pub allowed_domains: Vec<String>,
}

impl Default for HttpEnvironmentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_content_chars: 8000,
            allowed_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Page {
    url: String,
    title: String,
    text: String,
    visited: Vec<String>,
}

pub struct HttpEnvironment {
    client: Client,
    allowed_domains: HashSet<String>,
    max_content_chars: usize,
    page: Mutex<Page>,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.contains('<') && (s.contains("</") || s.contains("<meta") || s.contains("<head")))
}

/// 从 URL 中提取 host（小写，不含端口）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

fn extract_title(html: &str) -> String {
    let lower = html.to_lowercase();
    let Some(start) = lower.find("<title") else {
        return String::new();
    };
    let Some(open_end) = lower[start..].find('>').map(|i| start + i + 1) else {
        return String::new();
    };
    let Some(close) = lower[open_end..].find("</title>").map(|i| open_end + i) else {
        return String::new();
    };
    html.get(open_end..close).unwrap_or_default().trim().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        text.chars().take(max).collect::<String>() + "\n...[truncated]"
    } else {
        text.to_string()
    }
}

/// 搜索结果页地址
fn search_url(query: &str) -> String {
    format!("{}{}", SEARCH_URL, urlencoding::encode(query.trim()))
}

impl HttpEnvironment {
    pub fn new(config: HttpEnvironmentConfig) -> Result<Self, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9,zh-CN;q=0.8"));
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| AgentError::EnvironmentError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            allowed_domains: config.allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_content_chars: config.max_content_chars,
            page: Mutex::new(Page::default()),
        })
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| format!("Invalid or missing URL: {}", url))?;
        if self.allowed_domains.is_empty() || self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {}", domain))
        }
    }

    fn html_to_text(html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    async fn fetch(&self, url: &str) -> Result<(String, String), String> {
        self.check_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let body = body.strip_prefix('\u{FEFF}').unwrap_or(&body);
        if looks_like_html(body) {
            Ok((extract_title(body), Self::html_to_text(body)))
        } else {
            Ok((String::new(), body.to_string()))
        }
    }

    async fn navigate(&self, url: &str) -> ActionResult {
        tracing::info!(url = %url, "navigating");
        match self.fetch(url).await {
            Ok((title, text)) => {
                let mut page = self.page.lock().await;
                page.url = url.to_string();
                page.title = title;
                page.text = text;
                if !page.visited.iter().any(|u| u == url) {
                    page.visited.push(url.to_string());
                }
                ActionResult::content(format!("🔗 Navigated to {}", url))
            }
            Err(e) => ActionResult::failure(format!("go_to_url {} failed: {}", url, e)),
        }
    }
}

#[async_trait]
impl Environment for HttpEnvironment {
    async fn observe(&self) -> Result<EnvironmentState, AgentError> {
        let page = self.page.lock().await;
        Ok(EnvironmentState {
            url: page.url.clone(),
            title: page.title.clone(),
            tabs: page.visited.clone(),
            content: truncate_chars(&page.text, self.max_content_chars),
            screenshot: None,
        })
    }

    async fn execute(&self, actions: &[ActionModel]) -> Result<Vec<ActionResult>, AgentError> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let (result, page_changed) = match action.name.as_str() {
                "go_to_url" => match action.param_str("url") {
                    Some(url) if !url.trim().is_empty() => (self.navigate(url.trim()).await, true),
                    _ => (ActionResult::failure("go_to_url requires a url"), false),
                },
                "search_web" => match action.param_str("query") {
                    Some(q) if !q.trim().is_empty() => {
                        (self.navigate(&search_url(q)).await, true)
                    }
                    _ => (ActionResult::failure("search_web requires a query"), false),
                },
                "extract_page_content" => {
                    let page = self.page.lock().await;
                    let text = truncate_chars(&page.text, self.max_content_chars);
                    (ActionResult::content(format!("📄 Extracted page content from {}:\n{}", page.url, text)), false)
                }
                "done" => {
                    let text = action.param_str("text").map(str::to_string);
                    results.push(ActionResult::done(text));
                    break;
                }
                other => (ActionResult::failure(format!("Unknown action: {}", other)), false),
            };
            let failed = result.error.is_some();
            results.push(result);
            // 页面变化后停止本批次
            if page_changed && !failed {
                break;
            }
        }
        Ok(results)
    }

    fn action_descriptions(&self) -> String {
        ACTION_DESCRIPTIONS.to_string()
    }
}

/// 为每个研究子任务创建独立的 HttpEnvironment
#[derive(Debug, Clone, Default)]
pub struct HttpEnvironmentFactory {
    config: HttpEnvironmentConfig,
}

impl HttpEnvironmentFactory {
    pub fn new(config: HttpEnvironmentConfig) -> Self {
        Self { config }
    }
}

impl EnvironmentFactory for HttpEnvironmentFactory {
    fn create(&self) -> Result<Arc<dyn Environment>, AgentError> {
        Ok(Arc::new(HttpEnvironment::new(self.config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn env(allowed: &[&str]) -> HttpEnvironment {
        HttpEnvironment::new(HttpEnvironmentConfig {
            allowed_domains: allowed.iter().map(|s| s.to_string()).collect(),
            ..HttpEnvironmentConfig::default()
        })
        .unwrap()
    }

    fn action(name: &str, params: serde_json::Value) -> ActionModel {
        serde_json::from_value(json!({ name: params })).unwrap()
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio"), Some("docs.rs".into()));
        assert_eq!(extract_domain("http://a.b:8080?x=1"), Some("a.b".into()));
        assert_eq!(extract_domain("ftp://a.b"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_title_and_text() {
        let html = "<html><head><title> Hello </title></head><body><p>World</p></body></html>";
        assert_eq!(extract_title(html), "Hello");
        assert!(HttpEnvironment::html_to_text(html).contains("World"));
        assert_eq!(strip_html_tags("<b>a</b><i>b</i>"), "a b");
    }

    #[test]
    fn test_search_url_encodes_query() {
        assert_eq!(search_url(" rust async "), format!("{}rust%20async", SEARCH_URL));
        assert_eq!(search_url("a&b=c"), format!("{}a%26b%3Dc", SEARCH_URL));
    }

    #[tokio::test]
    async fn test_allowlist_rejection_is_action_failure() {
        let env = env(&["docs.rs"]);
        let results = env
            .execute(&[action("go_to_url", json!({"url": "https://evil.example/x"}))])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].error.as_deref().unwrap().contains("allowlist"));
    }

    #[tokio::test]
    async fn test_extract_then_done_stops_batch() {
        let env = env(&[]);
        let results = env
            .execute(&[
                action("extract_page_content", json!({})),
                action("done", json!({"text": "answer"})),
                action("extract_page_content", json!({})),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].extracted_content.as_deref().unwrap().contains("Extracted page"));
        assert!(results[1].is_done);
        assert_eq!(results[1].extracted_content.as_deref(), Some("answer"));
    }

    #[tokio::test]
    async fn test_unknown_action_and_blank_state() {
        let env = env(&[]);
        let results = env.execute(&[action("fly", json!(null))]).await.unwrap();
        assert_eq!(results[0].error.as_deref(), Some("Unknown action: fly"));
        let state = env.observe().await.unwrap();
        assert_eq!(state, EnvironmentState::default());
        assert!(env.action_descriptions().contains("go_to_url"));
    }
}
