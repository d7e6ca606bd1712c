use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Value of an environment variable: a single string or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    List(Vec<String>),
}

impl Value {
    /// Words of the value, a string is a single word.
    pub fn words(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::List(list) => list.clone(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::List(list) => f.write_str(&list.join(" ")),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<S: Into<String>> From<Vec<S>> for Value {
    fn from(value: Vec<S>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// Mapping of build variables (`CC`, `CFLAGS`, ...) used to interpolate
/// command templates.
///
/// Tasks hold an `Arc<Environment>`; once attached to a task the snapshot is
/// never mutated, derive a new one with [`Environment::derive`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    vars: BTreeMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this environment, to be modified before attaching to tasks.
    pub fn derive(&self) -> Self {
        self.clone()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Appends words to a variable, turning a string value into a list.
    pub fn append(&mut self, key: impl Into<String>, words: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        let entry = self
            .vars
            .entry(key.into())
            .or_insert_with(|| Value::List(Vec::new()));

        let mut list = entry.words();
        list.extend(words.into_iter().map(Into::into));
        *entry = Value::List(list);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Value of `key` rendered as a single string, empty if unset.
    pub fn get_str(&self, key: &str) -> String {
        self.vars.get(key).map(Value::to_string).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Replaces every `${NAME}` with the value of `NAME` from this
    /// environment, or from `extra` when present there. Lists are joined with
    /// spaces, unknown names expand to the empty string and `$$` produces a
    /// literal `$`.
    pub fn subst(&self, template: &str, extra: &BTreeMap<String, Value>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if let Some(after) = tail.strip_prefix("$$") {
                out.push('$');
                rest = after;
            } else if let Some(inner) = tail.strip_prefix("${")
                && let Some(end) = inner.find('}')
            {
                let name = &inner[..end];
                let value = extra.get(name).or_else(|| self.vars.get(name));
                if let Some(value) = value {
                    out.push_str(&value.to_string());
                }
                rest = &inner[end + 1..];
            } else {
                out.push('$');
                rest = &tail[1..];
            }
        }

        out.push_str(rest);
        out
    }

    /// Splits a template into argv words and interpolates each one. A word
    /// that consists of a single `${NAME}` referring to a list expands into
    /// one argument per list element.
    pub fn subst_argv(&self, template: &str, extra: &BTreeMap<String, Value>) -> Vec<String> {
        let mut argv = Vec::new();

        for word in template.split_whitespace() {
            let whole = word
                .strip_prefix("${")
                .and_then(|w| w.strip_suffix('}'))
                .filter(|name| !name.contains(['$', '{', '}']));

            match whole.and_then(|name| extra.get(name).or_else(|| self.vars.get(name))) {
                Some(Value::List(list)) => argv.extend(list.iter().cloned()),
                _ => argv.push(self.subst(word, extra)),
            }
        }

        argv
    }

    /// Names referenced as `${NAME}` in a template, in order of appearance.
    pub fn referenced(template: &str) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = template;

        while let Some(pos) = rest.find("${") {
            let inner = &rest[pos + 2..];
            match inner.find('}') {
                Some(end) => {
                    names.push(&inner[..end]);
                    rest = &inner[end + 1..];
                }
                None => break,
            }
        }

        names
    }
}
