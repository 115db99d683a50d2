//! The view helpers available to every template.
//!
//! They render recognisable placeholders rather than doing real work, so a
//! template calling them renders without a host framework. A binding with
//! the same name shadows the helper.

use super::context::ExecutionContext;
use super::value::{keys_match, values_eq, Value};
use crate::error::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    ContentFor,
    ContentForPresent,
    Capture,
    Concat,
    Raw,
    EscapeHtml,
    LinkTo,
    ImageTag,
    Render,
    Translate,
    Localize,
    Pluralize,
    Truncate,
    NumberToCurrency,
    TimeAgoInWords,
}

impl Helper {
    pub fn lookup(name: &str) -> Option<Helper> {
        Some(match name {
            "content_for" => Helper::ContentFor,
            "content_for?" => Helper::ContentForPresent,
            "capture" => Helper::Capture,
            "concat" => Helper::Concat,
            "raw" | "html_safe" => Helper::Raw,
            "h" | "escape_html" => Helper::EscapeHtml,
            "link_to" => Helper::LinkTo,
            "image_tag" => Helper::ImageTag,
            "render" => Helper::Render,
            "t" | "translate" => Helper::Translate,
            "l" | "localize" => Helper::Localize,
            "pluralize" => Helper::Pluralize,
            "truncate" => Helper::Truncate,
            "number_to_currency" => Helper::NumberToCurrency,
            "time_ago_in_words" => Helper::TimeAgoInWords,
            _ => return None,
        })
    }

    /// Whether a block given to this helper is run with its output captured
    /// instead of written to the page.
    pub fn captures_block(self) -> bool {
        matches!(
            self,
            Helper::ContentFor | Helper::Capture | Helper::LinkTo | Helper::Render
        )
    }

    /// Apply the helper. `captured` is the output of its block, if one ran.
    pub fn call(
        self,
        args: &[Value],
        captured: Option<String>,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, RenderError> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Nil);
        Ok(match self {
            Helper::ContentFor => {
                let name = arg(0).to_s();
                match (captured, args.get(1)) {
                    (Some(content), _) => {
                        ctx.store_content(name, content);
                        Value::str("")
                    }
                    (None, Some(content)) => {
                        ctx.store_content(name, content.to_s());
                        Value::str("")
                    }
                    (None, None) => ctx.content(&name).map_or(Value::Nil, Value::str),
                }
            }
            Helper::ContentForPresent => Value::Bool(ctx.content(&arg(0).to_s()).is_some()),
            Helper::Capture => Value::Str(captured.unwrap_or_default()),
            Helper::Concat | Helper::Raw => Value::Str(arg(0).to_s()),
            Helper::EscapeHtml => Value::Str(escape_html(&arg(0).to_s())),
            Helper::LinkTo => {
                let (text, url) = match captured {
                    Some(text) => (text, arg(0)),
                    None => (arg(0).to_s(), arg(1)),
                };
                let url = match url.resolved() {
                    Value::Nil | Value::Hash(_) => "#".to_string(),
                    other => other.to_s(),
                };
                Value::Str(format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(&url),
                    escape_html(&text)
                ))
            }
            Helper::ImageTag => Value::Str(format!("<img src=\"{}\" />", escape_html(&arg(0).to_s()))),
            Helper::Render => match captured {
                Some(content) => Value::Str(content),
                None => Value::Str(format!("[rendered: {}]", arg(0).inspect())),
            },
            Helper::Translate => Value::Str(format!("[translation:{}]", arg(0).to_s())),
            Helper::Localize => Value::Str(format!("[localized:{}]", arg(0).to_s())),
            Helper::Pluralize => {
                let count = arg(0);
                let singular = arg(1).to_s();
                let word = if values_eq(&count, &Value::Int(1)) {
                    singular
                } else {
                    match args.get(2) {
                        Some(plural) if !matches!(plural.resolved(), Value::Nil) => plural.to_s(),
                        _ => format!("{singular}s"),
                    }
                };
                Value::Str(format!("{} {word}", count.to_s()))
            }
            Helper::Truncate => {
                let length = option(args.get(1), "length")
                    .and_then(|v| v.to_i())
                    .unwrap_or(30)
                    .max(0) as usize;
                Value::Str(arg(0).to_s().chars().take(length).collect())
            }
            Helper::NumberToCurrency => Value::Str(format!("${}", arg(0).to_s())),
            Helper::TimeAgoInWords => Value::Str(format!("[time_ago:{}]", arg(0).to_s())),
        })
    }
}

/// Read `name` out of a trailing options hash.
fn option(options: Option<&Value>, name: &str) -> Option<Value> {
    let Value::Hash(pairs) = options?.resolved() else {
        return None;
    };
    let key = Value::Sym(name.to_string());
    let found = pairs
        .borrow()
        .iter()
        .find(|(k, _)| keys_match(k, &key))
        .map(|(_, v)| v.clone());
    found
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> String {
        let mut ctx = ExecutionContext::new();
        Helper::lookup(name)
            .unwrap()
            .call(args, None, &mut ctx)
            .unwrap()
            .to_s()
    }

    #[test]
    fn test_link_and_image() {
        assert_eq!(
            call("link_to", &[Value::str("A&B"), Value::str("/x?a=1&b=2")]),
            "<a href=\"/x?a=1&amp;b=2\">A&amp;B</a>"
        );
        assert_eq!(call("link_to", &[Value::str("Home")]), "<a href=\"#\">Home</a>");
        assert_eq!(call("image_tag", &[Value::str("a.png")]), "<img src=\"a.png\" />");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(call("t", &[Value::str("hello.title")]), "[translation:hello.title]");
        assert_eq!(call("localize", &[Value::Int(3)]), "[localized:3]");
        assert_eq!(call("number_to_currency", &[Value::Float(9.5)]), "$9.5");
        assert_eq!(call("time_ago_in_words", &[Value::mock("post.created_at")]), "[time_ago:[mock:post.created_at]]");
        assert_eq!(
            call("render", &[Value::str("shared/nav")]),
            "[rendered: \"shared/nav\"]"
        );
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(call("pluralize", &[Value::Int(1), Value::str("item")]), "1 item");
        assert_eq!(call("pluralize", &[Value::Int(2), Value::str("item")]), "2 items");
        assert_eq!(
            call("pluralize", &[Value::Int(0), Value::str("person"), Value::str("people")]),
            "0 people"
        );
    }

    #[test]
    fn test_truncate() {
        let long = "x".repeat(40);
        assert_eq!(call("truncate", &[Value::str(long.clone())]).len(), 30);
        let opts = Value::hash(vec![(Value::Sym("length".into()), Value::Int(5))]);
        assert_eq!(call("truncate", &[Value::str(long), opts]), "xxxxx");
    }

    #[test]
    fn test_escape_and_raw() {
        assert_eq!(call("h", &[Value::str("<b>\"hi\"</b>")]), "&lt;b&gt;&quot;hi&quot;&lt;/b&gt;");
        assert_eq!(call("raw", &[Value::str("<b>")]), "<b>");
    }

    #[test]
    fn test_content_for_stores_and_reads() {
        let mut ctx = ExecutionContext::new();
        let stored = Helper::ContentFor
            .call(&[Value::Sym("title".into())], Some("Hello".into()), &mut ctx)
            .unwrap();
        assert_eq!(stored.to_s(), "");
        let read = Helper::ContentFor
            .call(&[Value::Sym("title".into())], None, &mut ctx)
            .unwrap();
        assert_eq!(read.to_s(), "Hello");
        assert!(Helper::ContentForPresent
            .call(&[Value::str("title")], None, &mut ctx)
            .unwrap()
            .truthy());
    }
}
