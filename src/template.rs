//! Markup layer: splits ERB-style template text into segments and nests the
//! embedded-code tags into a control-structure tree.
//!
//! Every byte of the source belongs to exactly one [`Segment`], so a consumer
//! that reproduces each segment's newlines keeps line numbers aligned with the
//! template.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::lang::lexer::LineIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal markup.
    Text,
    /// `<% code %>`
    Code,
    /// `<%= expr %>` / `<%== expr %>`
    Output,
    /// `<%# ... %>`
    Comment,
    /// Whitespace removed by tag trimming; contributes newlines only.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Literal text for `Text`/`Skipped`, tag contents otherwise.
    pub text: String,
    /// Newlines in the source bytes this segment spans.
    pub newlines: usize,
    pub line: u32,
}

/// Split template source into segments.
///
/// Code and comment tags that sit alone on their line swallow the line's
/// indentation and trailing newline. `-%>` swallows the following newline,
/// `<%-` the preceding indentation.
pub fn scan(source: &str) -> Result<Vec<Segment>> {
    let index = LineIndex::new(source);
    let mut out = Scanner {
        source,
        index: &index,
        segments: Vec::new(),
        text: String::new(),
        text_start: 0,
    };
    let mut pos = 0;

    while let Some(rel) = source[pos..].find("<%") {
        let open = pos + rel;
        out.text.push_str(&source[pos..open]);
        if source[open..].starts_with("<%%") {
            out.text.push_str("<%");
            pos = open + 3;
            continue;
        }

        let after = open + 2;
        let rest = &source[after..];
        let (kind, body_start, trim_left) = if rest.starts_with("==") {
            (SegmentKind::Output, after + 2, false)
        } else if rest.starts_with('=') {
            (SegmentKind::Output, after + 1, false)
        } else if rest.starts_with('#') {
            (SegmentKind::Comment, after + 1, false)
        } else if rest.starts_with('-') {
            (SegmentKind::Code, after + 1, true)
        } else {
            (SegmentKind::Code, after, false)
        };

        let Some(close_rel) = source[body_start..].find("%>") else {
            return Err(Error::parse(index.line_of(open), "unterminated template tag"));
        };
        let close = body_start + close_rel;
        let trim_right = close > body_start && source.as_bytes()[close - 1] == b'-';
        let body_end = if trim_right { close - 1 } else { close };
        let mut end = close + 2;

        let line_tail = trailing_blank_line(&source[end..]);
        let alone = kind != SegmentKind::Output && out.text_is_line_indent(open) && line_tail.is_some();

        if alone || (trim_left && out.text_is_line_indent(open)) {
            out.skip_indent(open);
        }
        out.flush_text(open);

        out.push(kind, &source[body_start..body_end], open, end);

        if let (true, Some(len)) = (alone, line_tail) {
            out.push(SegmentKind::Skipped, &source[end..end + len], end, end + len);
            end += len;
        } else if trim_right {
            let len = leading_newline(&source[end..]);
            if len > 0 {
                out.push(SegmentKind::Skipped, &source[end..end + len], end, end + len);
                end += len;
            }
        }

        pos = end;
        out.text_start = end;
    }

    out.text.push_str(&source[pos..]);
    out.flush_text(source.len());
    Ok(out.segments)
}

struct Scanner<'a> {
    source: &'a str,
    index: &'a LineIndex,
    segments: Vec<Segment>,
    text: String,
    text_start: usize,
}

impl Scanner<'_> {
    fn push(&mut self, kind: SegmentKind, text: &str, start: usize, end: usize) {
        self.segments.push(Segment {
            kind,
            text: text.to_string(),
            newlines: self.source[start..end].matches('\n').count(),
            line: self.index.line_of(start),
        });
    }

    /// Whether the pending text since the last newline is only indentation.
    fn text_is_line_indent(&self, open: usize) -> bool {
        let line_start = self.source[..open].rfind('\n').map_or(0, |i| i + 1);
        line_start >= self.text_start.min(open)
            && self.source[line_start..open].chars().all(|c| c == ' ' || c == '\t')
            && self.text.ends_with(&self.source[line_start..open])
    }

    fn skip_indent(&mut self, open: usize) {
        let indent = self
            .text
            .len()
            .saturating_sub(self.text.trim_end_matches([' ', '\t']).len());
        if indent == 0 {
            return;
        }
        let kept = self.text.len() - indent;
        let removed = self.text.split_off(kept);
        self.flush_text(open - indent);
        self.segments.push(Segment {
            kind: SegmentKind::Skipped,
            text: removed,
            newlines: 0,
            line: self.index.line_of(open),
        });
        self.text_start = open;
    }

    fn flush_text(&mut self, end: usize) {
        if self.text.is_empty() {
            self.text_start = end;
            return;
        }
        let text = std::mem::take(&mut self.text);
        self.segments.push(Segment {
            kind: SegmentKind::Text,
            newlines: text.matches('\n').count(),
            text,
            line: self.index.line_of(self.text_start),
        });
        self.text_start = end;
    }
}

/// Length of `[ \t]*\r?\n` (or the blank remainder at end of input).
fn trailing_blank_line(rest: &str) -> Option<usize> {
    let blank = rest.len() - rest.trim_start_matches([' ', '\t']).len();
    let after = &rest[blank..];
    if after.is_empty() {
        Some(blank)
    } else if after.starts_with("\r\n") {
        Some(blank + 2)
    } else if after.starts_with('\n') {
        Some(blank + 1)
    } else {
        None
    }
}

fn leading_newline(rest: &str) -> usize {
    if rest.starts_with("\r\n") {
        2
    } else if rest.starts_with('\n') {
        1
    } else {
        0
    }
}

// -- structural tree --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    If,
    Unless,
    Case,
    /// A `do |...|` or `{ |...|` block, e.g. `items.each do |item|`.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Elsif,
    Else,
    When,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub head: String,
    pub line: u32,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub kind: ControlKind,
    /// Opening tag contents, trimmed (`if user.admin?`).
    pub head: String,
    pub line: u32,
    /// Whether the opening tag was an output tag.
    pub output: bool,
    pub body: Vec<Node>,
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Code { code: String, line: u32 },
    Output { code: String, line: u32 },
    Control(Control),
}

static BLOCK_OPENER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\bdo|\{)\s*(\|[^|]*\|)?\s*$").unwrap());

fn keyword_head(code: &str, keyword: &str) -> bool {
    code == keyword
        || code
            .strip_prefix(keyword)
            .is_some_and(|rest| rest.starts_with([' ', '\t', '(', '\n', ';']))
}

enum Classified {
    Leaf,
    Open(ControlKind),
    Clause(ClauseKind),
    End,
}

fn classify(code: &str) -> Classified {
    let code = code.trim().trim_end_matches(';').trim_end();
    if code == "end" || code == "}" || code.starts_with("end ") || code.starts_with("end)") {
        return Classified::End;
    }
    if keyword_head(code, "elsif") {
        return Classified::Clause(ClauseKind::Elsif);
    }
    if code == "else" {
        return Classified::Clause(ClauseKind::Else);
    }
    if keyword_head(code, "when") {
        return Classified::Clause(ClauseKind::When);
    }
    // A complete one-line construct stays a leaf.
    if crate::lang::parse_program(code).is_ok() {
        return Classified::Leaf;
    }
    if keyword_head(code, "if") {
        Classified::Open(ControlKind::If)
    } else if keyword_head(code, "unless") {
        Classified::Open(ControlKind::Unless)
    } else if keyword_head(code, "case") {
        Classified::Open(ControlKind::Case)
    } else if BLOCK_OPENER_RE.is_match(code) {
        Classified::Open(ControlKind::Block)
    } else {
        Classified::Leaf
    }
}

/// Nest the code tags of a template into a control-structure tree.
///
/// Unbalanced `end` tags are ignored and unclosed structures are closed at
/// end of input; structural analysis is best-effort.
pub fn parse_template(source: &str) -> Result<Vec<Node>> {
    let segments = scan(source)?;
    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Control> = Vec::new();

    fn target<'a>(root: &'a mut Vec<Node>, stack: &'a mut [Control]) -> &'a mut Vec<Node> {
        match stack.last_mut() {
            Some(control) => match control.clauses.last_mut() {
                Some(clause) => &mut clause.body,
                None => &mut control.body,
            },
            None => root,
        }
    }

    for segment in segments {
        let output = match segment.kind {
            SegmentKind::Text => {
                target(&mut root, &mut stack).push(Node::Text(segment.text));
                continue;
            }
            SegmentKind::Comment | SegmentKind::Skipped => continue,
            SegmentKind::Output => true,
            SegmentKind::Code => false,
        };
        let code = segment.text.trim().to_string();
        if code.is_empty() {
            continue;
        }
        let line = segment.line;

        match classify(&code) {
            Classified::Leaf => {
                let node = if output {
                    Node::Output { code, line }
                } else {
                    Node::Code { code, line }
                };
                target(&mut root, &mut stack).push(node);
            }
            Classified::Open(kind) => stack.push(Control {
                kind,
                head: code,
                line,
                output,
                body: Vec::new(),
                clauses: Vec::new(),
            }),
            Classified::Clause(kind) => match stack.last_mut() {
                Some(control) => control.clauses.push(Clause {
                    kind,
                    head: code,
                    line,
                    body: Vec::new(),
                }),
                None => tracing::debug!(line, "clause outside any control structure"),
            },
            Classified::End => match stack.pop() {
                Some(control) => target(&mut root, &mut stack).push(Node::Control(control)),
                None => tracing::debug!(line, "unbalanced end tag"),
            },
        }
    }

    while let Some(control) = stack.pop() {
        tracing::debug!(line = control.line, head = %control.head, "unclosed control structure");
        target(&mut root, &mut stack).push(Node::Control(control));
    }

    Ok(root)
}
