//! Turns a permutation's forced values into context bindings.
//!
//! Each key is a path such as `user.profile.active?`, `params[:q].present?`
//! or `@products.__block_item__.in_stock?`. Paths sharing a root are merged
//! into one shape tree, which is then realised as immutable [`MockObject`]s.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use super::context::ExecutionContext;
use super::value::{keys_match, values_eq, MockObject, MockValue, Value};
use crate::model::{ForcedValue, Permutation, BLOCK_ITEM, UNMATCHED};

/// One step after the root of a path.
#[derive(Debug, Clone)]
pub enum Segment {
    Method(String),
    Key(Value),
    /// The single item an iterator yields.
    Item,
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Segment::Method(a), Segment::Method(b)) => a == b,
            (Segment::Key(a), Segment::Key(b)) => values_eq(a, b),
            (Segment::Item, Segment::Item) => true,
            _ => false,
        }
    }
}

/// Split a path into its root name and the segments after it. Returns
/// `None` for paths with no usable root, e.g. `[1, 2].include?`.
pub fn parse_path(path: &str) -> Option<(String, Vec<Segment>)> {
    let bytes = path.as_bytes();
    let root_end = scan_name(path, 0);
    let root = &path[..root_end];
    if root.is_empty() || root == "self" {
        return None;
    }

    let mut segments = Vec::new();
    let mut i = root_end;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                let end = scan_name(path, i + 1);
                let name = &path[i + 1..end];
                if name.is_empty() {
                    return None;
                }
                segments.push(if name == BLOCK_ITEM {
                    Segment::Item
                } else {
                    Segment::Method(name.to_string())
                });
                i = end;
            }
            b'[' => {
                let close = matching_bracket(path, i)?;
                segments.push(Segment::Key(parse_key(path[i + 1..close].trim())));
                i = close + 1;
            }
            _ => return None,
        }
    }
    Some((root.to_string(), segments))
}

/// End of a name starting at `start`: up to the next `.` or `[`.
fn scan_name(path: &str, start: usize) -> usize {
    path[start..]
        .find(['.', '['])
        .map_or(path.len(), |off| start + off)
}

fn matching_bracket(path: &str, open: usize) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in path[open..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_key(text: &str) -> Value {
    if let Some(name) = text.strip_prefix(':') {
        return Value::Sym(name.trim_matches('"').to_string());
    }
    if text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')))
    {
        return Value::Str(text[1..text.len() - 1].to_string());
    }
    match text.parse::<i64>() {
        Ok(i) => Value::Int(i),
        Err(_) => Value::Str(text.to_string()),
    }
}

fn realise(value: &ForcedValue) -> Value {
    match value {
        ForcedValue::Bool(b) => Value::Bool(*b),
        ForcedValue::Str(s) => Value::Str(s.clone()),
        ForcedValue::Symbol(s) => Value::Sym(s.clone()),
        ForcedValue::Unmatched => Value::Str(UNMATCHED.to_string()),
    }
}

#[derive(Debug, Default)]
struct Shape {
    leaf: Option<Value>,
    methods: BTreeMap<String, Shape>,
    keys: Vec<(Value, Shape)>,
    item: Option<Box<Shape>>,
}

impl Shape {
    fn has_children(&self) -> bool {
        !self.methods.is_empty() || !self.keys.is_empty() || self.item.is_some()
    }

    fn child(&mut self, segment: &Segment) -> &mut Shape {
        match segment {
            Segment::Method(name) => self.methods.entry(name.clone()).or_default(),
            Segment::Item => &mut **self.item.get_or_insert_with(Box::default),
            Segment::Key(key) => {
                let pos = match self.keys.iter().position(|(k, _)| keys_match(k, key)) {
                    Some(pos) => pos,
                    None => {
                        self.keys.push((key.clone(), Shape::default()));
                        self.keys.len() - 1
                    }
                };
                &mut self.keys[pos].1
            }
        }
    }

    /// Set the forced value at this node. A node already shaped by deeper
    /// paths keeps its shape, except a root variable forced `false`.
    fn set(&mut self, value: Value, root: bool) {
        if self.has_children() {
            if !(root && matches!(value, Value::Bool(false))) {
                return;
            }
            self.methods.clear();
            self.keys.clear();
            self.item = None;
        }
        self.leaf = Some(value);
    }

    fn into_value(self, label: &str, root: bool) -> Value {
        if !self.has_children() {
            return match self.leaf {
                // A forced-true root stays chainable.
                Some(Value::Bool(true)) if root => Value::mock(label),
                Some(value) => Value::Mock(MockValue::seeded(label, value)),
                None => Value::mock(label),
            };
        }
        let mut obj = MockObject::new(label);
        for (name, shape) in self.methods {
            let value = shape.into_value(&format!("{label}.{name}"), false);
            obj.methods.insert(name, value);
        }
        for (key, shape) in self.keys {
            let value = shape.into_value(&format!("{label}[{}]", key.inspect()), false);
            obj.keys.push((key, value));
        }
        if let Some(item) = self.item {
            obj.items = Some(vec![item.into_value(&format!("{label}.{BLOCK_ITEM}"), false)]);
        }
        Value::Object(Rc::new(obj))
    }
}

/// Bind every forced value of `permutation` into `ctx`. Deeper paths are
/// applied first so a shallower value cannot erase the object they shape.
pub fn bind_permutation(ctx: &mut ExecutionContext, permutation: &Permutation) {
    let mut paths: Vec<(String, Vec<Segment>, &ForcedValue)> = Vec::new();
    for (key, value) in permutation.iter() {
        match parse_path(key) {
            Some((root, segments)) => paths.push((root, segments, value)),
            None => debug!(path = %key, "skipping unbindable path"),
        }
    }
    paths.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut roots: Vec<(String, Shape)> = Vec::new();
    for (root, segments, value) in paths {
        let pos = match roots.iter().position(|(name, _)| *name == root) {
            Some(pos) => pos,
            None => {
                roots.push((root, Shape::default()));
                roots.len() - 1
            }
        };
        let mut node = &mut roots[pos].1;
        for segment in &segments {
            node = node.child(segment);
        }
        node.set(realise(value), segments.is_empty());
    }

    for (root, shape) in roots {
        let value = shape.into_value(&root, true);
        ctx.bind(root, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(pairs: &[(&str, ForcedValue)]) -> ExecutionContext {
        let perm: Permutation = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let mut ctx = ExecutionContext::new();
        bind_permutation(&mut ctx, &perm);
        ctx
    }

    fn object(ctx: &ExecutionContext, name: &str) -> Rc<MockObject> {
        match ctx.lookup(name) {
            Some(Value::Object(obj)) => obj.clone(),
            other => panic!("expected object for {name}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_path_shapes() {
        assert_eq!(
            parse_path("user.profile.active?").unwrap(),
            (
                "user".to_string(),
                vec![
                    Segment::Method("profile".into()),
                    Segment::Method("active?".into())
                ]
            )
        );
        assert_eq!(
            parse_path("params[:q].present?").unwrap().1,
            vec![
                Segment::Key(Value::Sym("q".into())),
                Segment::Method("present?".into())
            ]
        );
        let (root, segments) = parse_path("@products.__block_item__.in_stock?").unwrap();
        assert_eq!(root, "@products");
        assert_eq!(segments[0], Segment::Item);
        assert_eq!(parse_path("Feature::Flag.on?").unwrap().0, "Feature::Flag");
        assert_eq!(parse_path("count.>").unwrap().1, vec![Segment::Method(">".into())]);
        assert!(parse_path("[1, 2].include?").is_none());
    }

    #[test]
    fn test_parse_key_literals() {
        assert!(matches!(parse_key(":notice"), Value::Sym(s) if s == "notice"));
        assert!(matches!(parse_key("\"id\""), Value::Str(s) if s == "id"));
        assert!(matches!(parse_key("0"), Value::Int(0)));
    }

    #[test]
    fn test_simple_values() {
        let ctx = bind(&[
            ("show", ForcedValue::Bool(true)),
            ("hide_banner", ForcedValue::Bool(false)),
            ("status", ForcedValue::Str("active".into())),
        ]);
        assert!(ctx.lookup("show").unwrap().is_unseeded_mock());
        assert!(!ctx.lookup("hide_banner").unwrap().truthy());
        assert_eq!(ctx.lookup("status").unwrap().to_s(), "active");
    }

    #[test]
    fn test_nested_chain() {
        let ctx = bind(&[
            ("user.profile.active?", ForcedValue::Bool(false)),
            ("user.admin?", ForcedValue::Bool(true)),
        ]);
        let user = object(&ctx, "user");
        assert!(user.method("admin?").unwrap().truthy());
        let Value::Object(profile) = user.method("profile").unwrap() else {
            panic!("expected profile object")
        };
        assert!(!profile.method("active?").unwrap().truthy());
    }

    #[test]
    fn test_deeper_path_survives_shallow_true() {
        let ctx = bind(&[
            ("issue.pull_request", ForcedValue::Bool(true)),
            ("issue.pull_request.open?", ForcedValue::Bool(false)),
        ]);
        let issue = object(&ctx, "issue");
        assert!(matches!(issue.method("pull_request"), Some(Value::Object(_))));
    }

    #[test]
    fn test_deeper_path_survives_shallow_false() {
        let ctx = bind(&[
            ("issue.pull_request", ForcedValue::Bool(false)),
            ("issue.pull_request.open?", ForcedValue::Bool(true)),
        ]);
        let issue = object(&ctx, "issue");
        let Some(Value::Object(pr)) = issue.method("pull_request") else {
            panic!("pull_request lost its nested mock");
        };
        assert!(pr.method("open?").is_some_and(Value::truthy));
    }

    #[test]
    fn test_shallow_false_replaces_object() {
        let ctx = bind(&[
            ("user", ForcedValue::Bool(false)),
            ("user.admin?", ForcedValue::Bool(true)),
        ]);
        assert!(!ctx.lookup("user").unwrap().truthy());
    }

    #[test]
    fn test_shallow_true_keeps_object() {
        let ctx = bind(&[
            ("user", ForcedValue::Bool(true)),
            ("user.admin?", ForcedValue::Bool(true)),
        ]);
        object(&ctx, "user");
    }

    #[test]
    fn test_hash_keys_merge() {
        let ctx = bind(&[
            ("flash[:notice]", ForcedValue::Bool(true)),
            ("flash[:alert]", ForcedValue::Bool(false)),
        ]);
        let flash = object(&ctx, "flash");
        assert!(flash.key(&Value::Sym("notice".into())).unwrap().truthy());
        assert!(!flash.key(&Value::str("alert")).unwrap().truthy());
        assert!(flash.key(&Value::Sym("other".into())).is_none());
    }

    #[test]
    fn test_block_item_iterator() {
        let ctx = bind(&[
            ("@products.__block_item__.in_stock?", ForcedValue::Bool(false)),
            ("@products.__block_item__.on_sale?", ForcedValue::Bool(true)),
        ]);
        let products = object(&ctx, "@products");
        let items = products.items.as_ref().unwrap();
        assert_eq!(items.len(), 1);
        let Value::Object(item) = &items[0] else {
            panic!("expected item object")
        };
        assert!(!item.method("in_stock?").unwrap().truthy());
        assert!(item.method("on_sale?").unwrap().truthy());
    }

    #[test]
    fn test_dotted_iterator() {
        let ctx = bind(&[("user.orders.__block_item__.late?", ForcedValue::Bool(true))]);
        let user = object(&ctx, "user");
        let Value::Object(orders) = user.method("orders").unwrap() else {
            panic!("expected orders object")
        };
        assert_eq!(orders.items.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_unmatched_and_symbol() {
        let ctx = bind(&[
            ("kind", ForcedValue::Unmatched),
            ("mode", ForcedValue::Symbol("dark".into())),
        ]);
        assert_eq!(ctx.lookup("kind").unwrap().to_s(), UNMATCHED);
        assert!(matches!(ctx.lookup("mode").unwrap().resolved(), Value::Sym(s) if s == "dark"));
    }
}
