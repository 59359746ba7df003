//! 动作提取：从流式生成文本中增量解析 `<shell>cmd</shell>` 与 `<file path="...">content</file>`
//!
//! ActionParser 是一个小状态机，逐块喂入生成输出：标签可能被切在两个 chunk 之间，
//! 此时保留可能构成标签前缀的尾部等待下一块。流被截断（未闭合）时 finish() 会把
//! 已收到的正文当作完整动作；文件头 `<file ...` 本身未闭合则丢弃。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const SHELL_OPEN: &str = "<shell>";
const SHELL_CLOSE: &str = "</shell>";
const FILE_OPEN: &str = "<file";
const FILE_CLOSE: &str = "</file>";

/// 动作执行与结果回灌的顺序（同一个开关同时决定两者）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOrder {
    /// 先全部 shell，再全部文件写入（各组内保持回复中的顺序）
    #[default]
    GroupedByKind,
    /// 严格按回复中出现的顺序
    ResponseOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Shell,
    FileWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Shell { command: String },
    FileWrite { path: String, content: String },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Shell { .. } => ActionKind::Shell,
            ActionPayload::FileWrite { .. } => ActionKind::FileWrite,
        }
    }

    /// 确认提示中展示的描述
    pub fn describe(&self) -> String {
        match self {
            ActionPayload::Shell { command } => format!("Run shell command: {command}"),
            ActionPayload::FileWrite { path, content } => {
                format!("Write {} bytes to {path}", content.len())
            }
        }
    }
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// 回灌给下一轮的文本
    pub report: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRequest {
    /// 在回复中的出现顺序
    pub index: usize,
    pub payload: ActionPayload,
    pub confirmed: bool,
    pub result: Option<ActionOutcome>,
}

impl ActionRequest {
    pub fn new(index: usize, payload: ActionPayload) -> Self {
        Self {
            index,
            payload,
            confirmed: false,
            result: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// 已确认且已执行
    pub fn executed(&self) -> bool {
        self.confirmed && self.result.is_some()
    }
}

fn path_attr_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"path\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).ok())
        .as_ref()
}

fn parse_path_attr(header: &str) -> Option<String> {
    let caps = path_attr_re()?.captures(header)?;
    let path = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// buf 尾部与 tag 前缀重合的最长长度（不含完整 tag）
fn partial_suffix_len(buf: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| buf.len() >= n && buf.is_char_boundary(buf.len() - n) && tag.starts_with(&buf[buf.len() - n..]))
        .unwrap_or(0)
}

#[derive(Debug)]
enum ParseState {
    Text,
    Shell { body: String },
    FileHeader { header: String },
    File { path: String, body: String },
}

#[derive(Debug)]
pub struct ActionParser {
    state: ParseState,
    buf: String,
    next_index: usize,
}

impl Default for ActionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Text,
            buf: String::new(),
            next_index: 0,
        }
    }

    /// 一次性解析完整文本
    pub fn parse_all(text: &str) -> Vec<ActionRequest> {
        let mut parser = Self::new();
        let mut actions = parser.feed(text);
        actions.extend(parser.finish());
        actions
    }

    fn emit(&mut self, payload: ActionPayload, out: &mut Vec<ActionRequest>) {
        let valid = match &payload {
            ActionPayload::Shell { command } => !command.is_empty(),
            ActionPayload::FileWrite { path, .. } => !path.is_empty(),
        };
        if valid {
            out.push(ActionRequest::new(self.next_index, payload));
            self.next_index += 1;
        }
    }

    /// 喂入一块文本，返回本块内闭合的动作
    pub fn feed(&mut self, chunk: &str) -> Vec<ActionRequest> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while self.step(&mut out) {}
        out
    }

    /// 推进一步；返回 false 表示需要更多输入
    fn step(&mut self, out: &mut Vec<ActionRequest>) -> bool {
        match std::mem::replace(&mut self.state, ParseState::Text) {
            ParseState::Text => {
                let shell = self.buf.find(SHELL_OPEN);
                let file = self.buf.find(FILE_OPEN);
                let next = match (shell, file) {
                    (Some(s), Some(f)) if f < s => Some((f, false)),
                    (Some(s), _) => Some((s, true)),
                    (None, Some(f)) => Some((f, false)),
                    (None, None) => None,
                };
                match next {
                    Some((pos, true)) => {
                        self.buf.drain(..pos + SHELL_OPEN.len());
                        self.state = ParseState::Shell { body: String::new() };
                        true
                    }
                    Some((pos, false)) => {
                        let after = pos + FILE_OPEN.len();
                        match self.buf[after..].chars().next() {
                            None => {
                                // "<file" 恰好在块尾，等下一块判断是否为标签
                                self.buf.drain(..pos);
                                false
                            }
                            Some(c) if c.is_whitespace() || c == '>' => {
                                self.buf.drain(..after);
                                self.state = ParseState::FileHeader {
                                    header: String::new(),
                                };
                                true
                            }
                            Some(_) => {
                                self.buf.drain(..after);
                                true
                            }
                        }
                    }
                    None => {
                        let keep = partial_suffix_len(&self.buf, SHELL_OPEN)
                            .max(partial_suffix_len(&self.buf, FILE_OPEN));
                        let cut = self.buf.len() - keep;
                        self.buf.drain(..cut);
                        false
                    }
                }
            }
            ParseState::Shell { mut body } => {
                if let Some(pos) = self.buf.find(SHELL_CLOSE) {
                    body.push_str(&self.buf[..pos]);
                    self.buf.drain(..pos + SHELL_CLOSE.len());
                    let command = body.trim().to_string();
                    self.emit(ActionPayload::Shell { command }, out);
                    true
                } else {
                    let keep = partial_suffix_len(&self.buf, SHELL_CLOSE);
                    let cut = self.buf.len() - keep;
                    body.extend(self.buf.drain(..cut));
                    self.state = ParseState::Shell { body };
                    false
                }
            }
            ParseState::FileHeader { mut header } => {
                if let Some(pos) = self.buf.find('>') {
                    header.push_str(&self.buf[..pos]);
                    self.buf.drain(..=pos);
                    match parse_path_attr(&header) {
                        Some(path) => {
                            self.state = ParseState::File {
                                path,
                                body: String::new(),
                            };
                        }
                        None => {
                            tracing::debug!(header = %header, "file tag without path attribute ignored");
                        }
                    }
                    true
                } else {
                    header.extend(self.buf.drain(..));
                    self.state = ParseState::FileHeader { header };
                    false
                }
            }
            ParseState::File { path, mut body } => {
                if let Some(pos) = self.buf.find(FILE_CLOSE) {
                    body.push_str(&self.buf[..pos]);
                    self.buf.drain(..pos + FILE_CLOSE.len());
                    let content = strip_leading_newline(body);
                    self.emit(ActionPayload::FileWrite { path, content }, out);
                    true
                } else {
                    let keep = partial_suffix_len(&self.buf, FILE_CLOSE);
                    let cut = self.buf.len() - keep;
                    body.extend(self.buf.drain(..cut));
                    self.state = ParseState::File { path, body };
                    false
                }
            }
        }
    }

    /// 流结束：未闭合的动作正文截至文本末尾
    pub fn finish(&mut self) -> Vec<ActionRequest> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buf);
        match std::mem::replace(&mut self.state, ParseState::Text) {
            ParseState::Shell { mut body } => {
                body.push_str(&rest);
                let command = body.trim().to_string();
                self.emit(ActionPayload::Shell { command }, &mut out);
            }
            ParseState::File { path, mut body } => {
                body.push_str(&rest);
                let content = strip_leading_newline(body);
                self.emit(ActionPayload::FileWrite { path, content }, &mut out);
            }
            ParseState::FileHeader { header } => {
                tracing::debug!(header = %header, "unterminated file header dropped");
            }
            ParseState::Text => {}
        }
        out
    }
}

fn strip_leading_newline(body: String) -> String {
    match body.strip_prefix("\r\n").or_else(|| body.strip_prefix('\n')) {
        Some(rest) => rest.to_string(),
        None => body,
    }
}

/// 按 ReplayOrder 给出执行顺序（下标）
pub fn execution_order(actions: &[ActionRequest], order: ReplayOrder) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..actions.len()).collect();
    idx.sort_by_key(|&i| actions[i].index);
    if order == ReplayOrder::GroupedByKind {
        idx.sort_by_key(|&i| match actions[i].kind() {
            ActionKind::Shell => 0,
            ActionKind::FileWrite => 1,
        });
    }
    idx
}

/// 把已执行动作的结果按 ReplayOrder 拼接，截断到 budget 字符；
/// 被拒绝的动作不出现；没有任何已执行动作时返回 None
pub fn build_feedback(actions: &[ActionRequest], order: ReplayOrder, budget: usize) -> Option<String> {
    let reports: Vec<&str> = execution_order(actions, order)
        .into_iter()
        .map(|i| &actions[i])
        .filter(|a| a.confirmed)
        .filter_map(|a| a.result.as_ref())
        .map(|r| r.report.as_str())
        .collect();
    if reports.is_empty() {
        return None;
    }
    let joined = reports.join("\n\n");
    Some(if joined.chars().count() > budget {
        joined.chars().take(budget).collect()
    } else {
        joined
    })
}
