//! Kind-specific semantic equality of manifests.

use serde_json::Value;

/// Rules deciding whether an observed manifest matches a desired one.
///
/// Sections are JSON pointers (RFC 6901) into the manifest.
///
/// - `exact` sections must be equal after normalization.
/// - `subset` sections must have every desired field present and equal in the
///   observed manifest. The observed side may carry extra, server-populated
///   fields. Arrays must match in length and element-wise.
/// - `ignored` paths are removed from both sides before comparing.
///
/// Normalization treats `null`, `{}`, `[]` and an absent field alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquivalencePolicy {
    exact: Vec<String>,
    subset: Vec<String>,
    ignored: Vec<String>,
}

impl EquivalencePolicy {
    /// An empty policy (everything is equivalent).
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare a section exactly.
    pub fn exact(mut self, pointer: impl Into<String>) -> Self {
        self.exact.push(pointer.into());
        self
    }

    /// Compare a section as a desired-subset-of-observed.
    pub fn subset(mut self, pointer: impl Into<String>) -> Self {
        self.subset.push(pointer.into());
        self
    }

    /// Ignore a path on both sides.
    pub fn ignore(mut self, pointer: impl Into<String>) -> Self {
        self.ignored.push(pointer.into());
        self
    }

    /// Whether `observed` matches `desired` under this policy.
    pub fn equivalent(&self, desired: &Value, observed: &Value) -> bool {
        let (desired, observed) = if self.ignored.is_empty() {
            (desired.clone(), observed.clone())
        } else {
            let mut d = desired.clone();
            let mut o = observed.clone();
            for pointer in &self.ignored {
                remove_pointer(&mut d, pointer);
                remove_pointer(&mut o, pointer);
            }
            (d, o)
        };

        let exact_ok = self
            .exact
            .iter()
            .all(|p| normalized(desired.pointer(p)) == normalized(observed.pointer(p)));

        exact_ok
            && self
                .subset
                .iter()
                .all(|p| is_subset(desired.pointer(p), observed.pointer(p)))
    }

    /// Copy every ignored path present in `observed` into `desired`, so a
    /// replace keeps fields the member cluster owns.
    pub fn retain_ignored(&self, desired: &mut Value, observed: &Value) {
        for pointer in &self.ignored {
            if let Some(value) = observed.pointer(pointer) {
                set_pointer(desired, pointer, value.clone());
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn normalized(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !is_empty(v))
}

fn is_subset(desired: Option<&Value>, observed: Option<&Value>) -> bool {
    let Some(desired) = normalized(desired) else {
        return true;
    };
    let Some(observed) = normalized(observed) else {
        return false;
    };

    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, v)| is_subset(Some(v), o.get(k))),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| is_subset_item(dv, ov))
        }
        (d, o) => d == o,
    }
}

/// Array elements must exist on both sides even when empty.
fn is_subset_item(desired: &Value, observed: &Value) -> bool {
    if is_empty(desired) {
        return is_empty(observed) || desired.is_null();
    }
    is_subset(Some(desired), Some(observed))
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_pointer(value: &mut Value, pointer: &str, new: Value) {
    let mut current = value;
    let mut tokens = pointer.split('/').skip(1).map(unescape).peekable();
    while let Some(token) = tokens.next() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if tokens.peek().is_none() {
            map.insert(token, new);
            return;
        }
        current = map.entry(token).or_insert(Value::Null);
    }
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let last = unescape(last);
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    match target {
        Some(Value::Object(map)) => {
            map.remove(&last);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}
