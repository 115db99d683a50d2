//! Runtime values, including the chainable mock placeholders that stand in
//! for anything a template reads but nobody supplied.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::rc::Rc;

/// Largest string, array or range a template may build.
pub const SIZE_LIMIT: usize = 1_000_000;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Hash(Rc<RefCell<Vec<(Value, Value)>>>),
    Range { start: i64, end: i64, exclusive: bool },
    Mock(MockValue),
    Object(Rc<MockObject>),
    /// Stub for a constant or constant path, e.g. `Feature::Flag`.
    Const(String),
}

/// Placeholder returned for unbound names and for members of other mocks.
#[derive(Debug, Clone)]
pub struct MockValue {
    pub label: Option<String>,
    pub seed: Seed,
}

#[derive(Debug, Clone)]
pub enum Seed {
    Unseeded,
    /// Every operation delegates to the wrapped value.
    Seeded(Box<Value>),
}

/// Immutable record realised from a permutation: answers fixed method names,
/// fixed keys, and optionally enumerates fixed items.
#[derive(Debug, Clone, Default)]
pub struct MockObject {
    pub label: String,
    pub methods: BTreeMap<String, Value>,
    pub keys: Vec<(Value, Value)>,
    pub items: Option<Vec<Value>>,
}

impl MockObject {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn method(&self, name: &str) -> Option<&Value> {
        self.methods.get(name)
    }

    /// Key lookup where `:k` and `"k"` are interchangeable.
    pub fn key(&self, key: &Value) -> Option<&Value> {
        self.keys
            .iter()
            .find(|(k, _)| keys_match(k, key))
            .map(|(_, v)| v)
    }
}

/// What an unseeded mock does for one member name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// String conversion: `[mock:<label>]`.
    Label,
    /// Collection conversion or transform: `[]`.
    Empty,
    /// Iteration that visits nothing and returns the receiver.
    Iterate,
    Zero,
    ZeroFloat,
    Const(bool),
    /// `first`/`last`: a mock labelled `<label>.<name>`.
    Child,
    Equal,
    NotEqual,
    Spaceship,
    /// Arithmetic: a mock labelled `<label><op>`.
    Arithmetic,
    Index,
    /// Anything else: a mock labelled `<label>.<name>`.
    Chain,
}

impl MockOp {
    pub fn for_member(name: &str) -> MockOp {
        match name {
            "to_s" | "to_str" | "inspect" | "html_safe" => MockOp::Label,
            "to_a" | "to_ary" | "map" | "collect" | "select" | "filter" | "reject"
            | "filter_map" | "flat_map" | "compact" | "uniq" | "sort" | "sort_by" => MockOp::Empty,
            "each" | "each_with_index" => MockOp::Iterate,
            "to_i" | "to_int" | "length" | "size" | "count" => MockOp::Zero,
            "to_f" => MockOp::ZeroFloat,
            "empty?" | "present?" | ">" | ">=" | "<=" | "none?" => MockOp::Const(true),
            "!" | "nil?" | "blank?" | "any?" | "<" => MockOp::Const(false),
            "first" | "last" => MockOp::Child,
            "==" | "eql?" | "equal?" => MockOp::Equal,
            "!=" => MockOp::NotEqual,
            "<=>" => MockOp::Spaceship,
            "+" | "-" | "*" | "/" | "%" => MockOp::Arithmetic,
            "[]" => MockOp::Index,
            _ => MockOp::Chain,
        }
    }
}

impl MockValue {
    pub fn unseeded(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            seed: Seed::Unseeded,
        }
    }

    pub fn seeded(label: impl Into<String>, value: Value) -> Self {
        Self {
            label: Some(label.into()),
            seed: Seed::Seeded(Box::new(value)),
        }
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("value")
    }

    /// A mock labelled `<label><suffix>`.
    pub fn child(&self, suffix: &str) -> Value {
        Value::Mock(MockValue::unseeded(format!("{}{suffix}", self.display_label())))
    }

    /// Answer for `name` on an unseeded mock, for members that need no
    /// evaluator support. Iteration and indexing are handled by the caller.
    pub fn answer(&self, op: MockOp, name: &str, args: &[Value]) -> Value {
        match op {
            MockOp::Label => Value::Str(format!("[mock:{}]", self.display_label())),
            MockOp::Empty => Value::array(Vec::new()),
            MockOp::Iterate => Value::Mock(self.clone()),
            MockOp::Zero => Value::Int(0),
            MockOp::ZeroFloat => Value::Float(0.0),
            MockOp::Const(b) => Value::Bool(b),
            MockOp::Child => self.child(&format!(".{name}")),
            MockOp::Equal => Value::Bool(args.first().is_some_and(Value::is_unseeded_mock)),
            MockOp::NotEqual => Value::Bool(!args.first().is_some_and(Value::is_unseeded_mock)),
            MockOp::Spaceship => Value::Int(0),
            MockOp::Arithmetic => self.child(name),
            MockOp::Index => {
                let key = args.first().map_or_else(|| "nil".to_string(), Value::inspect);
                self.child(&format!("[{key}]"))
            }
            MockOp::Chain => self.child(&format!(".{name}")),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn hash(pairs: Vec<(Value, Value)>) -> Value {
        Value::Hash(Rc::new(RefCell::new(pairs)))
    }

    pub fn mock(label: impl Into<String>) -> Value {
        Value::Mock(MockValue::unseeded(label))
    }

    /// Strip seeded mocks down to the value they wrap.
    pub fn resolved(&self) -> &Value {
        let mut value = self;
        while let Value::Mock(MockValue {
            seed: Seed::Seeded(inner),
            ..
        }) = value
        {
            value = inner;
        }
        value
    }

    pub fn is_unseeded_mock(&self) -> bool {
        matches!(
            self.resolved(),
            Value::Mock(MockValue {
                seed: Seed::Unseeded,
                ..
            })
        )
    }

    pub fn truthy(&self) -> bool {
        !matches!(self.resolved(), Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self.resolved() {
            Value::Nil => "nil",
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
            Value::Sym(_) => "Symbol",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Range { .. } => "Range",
            Value::Mock(_) | Value::Object(_) => "MockValue",
            Value::Const(_) => "Module",
        }
    }

    /// String conversion as `to_s` would produce it.
    pub fn to_s(&self) -> String {
        match self.resolved() {
            Value::Nil => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) | Value::Sym(s) => s.clone(),
            Value::Array(_) | Value::Hash(_) => self.inspect(),
            Value::Range {
                start,
                end,
                exclusive,
            } => format!("{start}{}{end}", if *exclusive { "..." } else { ".." }),
            Value::Mock(mock) => format!("[mock:{}]", mock.display_label()),
            Value::Object(obj) => format!("[mock:{}]", obj.label),
            Value::Const(path) => path.clone(),
        }
    }

    /// Developer-facing form, e.g. `"a"`, `:sym`, `[1, nil]`, `{a: 1}`.
    pub fn inspect(&self) -> String {
        match self.resolved() {
            Value::Nil => "nil".to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::Sym(s) => format!(":{s}"),
            Value::Array(items) => {
                let items: Vec<String> = items.borrow().iter().map(Value::inspect).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Hash(pairs) => {
                let mut out = String::from("{");
                for (i, (k, v)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match k {
                        Value::Sym(name) => write!(out, "{name}: {}", v.inspect()).unwrap(),
                        _ => write!(out, "{} => {}", k.inspect(), v.inspect()).unwrap(),
                    }
                }
                out.push('}');
                out
            }
            other => other.to_s(),
        }
    }

    /// Integer conversion, used where a numeric argument is required.
    pub fn to_i(&self) -> Option<i64> {
        match self.resolved() {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Nil => Some(0),
            Value::Mock(_) => Some(0),
            Value::Str(s) => Some(leading_int(s)),
            _ => None,
        }
    }

    pub fn to_f(&self) -> Option<f64> {
        match self.resolved() {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Nil | Value::Mock(_) => Some(0.0),
            Value::Str(s) => Some(s.trim().parse().unwrap_or(0.0)),
            _ => None,
        }
    }

    /// Items this value enumerates, if it is enumerable.
    pub fn items(&self) -> Option<Vec<Value>> {
        match self.resolved() {
            Value::Array(items) => Some(items.borrow().clone()),
            Value::Hash(pairs) => Some(
                pairs
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::array(vec![k.clone(), v.clone()]))
                    .collect(),
            ),
            Value::Range {
                start,
                end,
                exclusive,
            } => {
                let last = if *exclusive { end.checked_sub(1)? } else { *end };
                if last.saturating_sub(*start) >= SIZE_LIMIT as i64 {
                    return None;
                }
                Some((*start..=last).map(Value::Int).collect())
            }
            Value::Object(obj) => obj.items.clone(),
            Value::Mock(MockValue {
                seed: Seed::Unseeded,
                ..
            }) => Some(Vec::new()),
            _ => None,
        }
    }
}

/// Equality as `==` sees it.
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.resolved(), b.resolved()) {
        (Value::Mock(_), _) | (_, Value::Mock(_)) => a.is_unseeded_mock() && b.is_unseeded_mock(),
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Sym(x), Value::Sym(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| values_eq(p, q))
        }
        (Value::Hash(x), Value::Hash(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .any(|(k2, v2)| values_eq(k, k2) && values_eq(v, v2))
                })
        }
        (
            Value::Range {
                start: s1,
                end: e1,
                exclusive: x1,
            },
            Value::Range {
                start: s2,
                end: e2,
                exclusive: x2,
            },
        ) => s1 == s2 && e1 == e2 && x1 == x2,
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Const(x), Value::Const(y)) => x == y,
        _ => false,
    }
}

/// `pattern === subject` for `case`/`when`.
pub fn case_eq(pattern: &Value, subject: &Value) -> bool {
    match (pattern.resolved(), subject.resolved()) {
        (
            Value::Range {
                start,
                end,
                exclusive,
            },
            Value::Int(i),
        ) => i >= start && (if *exclusive { i < end } else { i <= end }),
        (Value::Const(name), other) if !matches!(other, Value::Const(_)) => {
            other.type_name() == name.rsplit("::").next().unwrap_or(name)
        }
        _ => values_eq(pattern, subject),
    }
}

/// Keyed lookup where symbol and string keys of the same name match.
pub fn keys_match(a: &Value, b: &Value) -> bool {
    match (a.resolved(), b.resolved()) {
        (Value::Sym(x), Value::Str(y)) | (Value::Str(x), Value::Sym(y)) => x == y,
        _ => values_eq(a, b),
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    s[..end].parse().unwrap_or(0)
}

/// Convert an explicit JSON local into a runtime value. Objects become
/// mock objects answering both attribute calls and key lookups.
pub fn from_json(label: &str, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| from_json(&format!("{label}[{i}]"), item))
                .collect(),
        ),
        serde_json::Value::Object(fields) => {
            let mut obj = MockObject::new(label);
            for (name, field) in fields {
                let value = from_json(&format!("{label}.{name}"), field);
                obj.keys.push((Value::Sym(name.clone()), value.clone()));
                obj.methods.insert(name.clone(), value);
            }
            Value::Object(Rc::new(obj))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseeded_mock_table() {
        let mock = MockValue::unseeded("user");
        let answer = |name: &str| mock.answer(MockOp::for_member(name), name, &[]);
        assert_eq!(answer("to_s").to_s(), "[mock:user]");
        assert_eq!(answer("to_i").to_s(), "0");
        assert_eq!(answer("to_f").to_s(), "0.0");
        assert_eq!(answer("to_a").inspect(), "[]");
        assert!(answer("empty?").truthy());
        assert!(!answer("any?").truthy());
        assert!(!answer("!").truthy());
        assert!(answer(">").truthy());
        assert!(!answer("<").truthy());
        assert_eq!(answer("<=>").to_s(), "0");
        assert_eq!(answer("first").to_s(), "[mock:user.first]");
        assert_eq!(answer("profile").to_s(), "[mock:user.profile]");
        assert_eq!(answer("+").to_s(), "[mock:user+]");
    }

    #[test]
    fn test_mock_index_label_uses_inspect() {
        let mock = MockValue::unseeded("flash");
        let v = mock.answer(MockOp::Index, "[]", &[Value::Sym("notice".into())]);
        assert_eq!(v.to_s(), "[mock:flash[:notice]]");
    }

    #[test]
    fn test_unlabelled_mock() {
        let mock = MockValue {
            label: None,
            seed: Seed::Unseeded,
        };
        assert_eq!(Value::Mock(mock).to_s(), "[mock:value]");
    }

    #[test]
    fn test_mock_equality_only_between_unseeded() {
        let a = Value::mock("a");
        let b = Value::mock("b");
        assert!(values_eq(&a, &b));
        assert!(!values_eq(&a, &Value::str("[mock:a]")));
        assert!(!values_eq(&a, &Value::Nil));
    }

    #[test]
    fn test_seeded_mock_delegates() {
        let s = Value::Mock(MockValue::seeded("status", Value::str("active")));
        assert_eq!(s.to_s(), "active");
        assert!(values_eq(&s, &Value::str("active")));
        let f = Value::Mock(MockValue::seeded("ok", Value::Bool(false)));
        assert!(!f.truthy());
        assert!(Value::mock("x").truthy());
    }

    #[test]
    fn test_case_eq() {
        let range = Value::Range {
            start: 1,
            end: 5,
            exclusive: true,
        };
        assert!(case_eq(&range, &Value::Int(4)));
        assert!(!case_eq(&range, &Value::Int(5)));
        assert!(case_eq(&Value::Const("String".into()), &Value::str("x")));
        assert!(case_eq(&Value::Sym("a".into()), &Value::Sym("a".into())));
        assert!(!case_eq(&Value::str("a"), &Value::Sym("a".into())));
    }

    #[test]
    fn test_inspect_and_to_s() {
        let hash = Value::hash(vec![
            (Value::Sym("a".into()), Value::Int(1)),
            (Value::str("b"), Value::Nil),
        ]);
        assert_eq!(hash.inspect(), "{a: 1, \"b\" => nil}");
        assert_eq!(Value::Float(2.0).to_s(), "2.0");
        assert_eq!(Value::Float(2.5).to_s(), "2.5");
        assert_eq!(Value::Nil.to_s(), "");
        assert_eq!(Value::str("12ab").to_i(), Some(12));
    }

    #[test]
    fn test_from_json_object() {
        let json = serde_json::json!({"name": "Ada", "tags": ["x"], "admin": false});
        let value = from_json("user", &json);
        let Value::Object(obj) = &value else {
            panic!("expected object")
        };
        assert_eq!(obj.method("name").unwrap().to_s(), "Ada");
        assert_eq!(obj.key(&Value::str("name")).unwrap().to_s(), "Ada");
        assert!(!obj.method("admin").unwrap().truthy());
        assert_eq!(obj.method("tags").unwrap().inspect(), "[\"x\"]");
    }
}
