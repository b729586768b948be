//! Wire format of hub messages and the reaction a page applies to them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `type` field of a message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    /// File contents changed.
    Change,
    /// File created, removed or renamed.
    Rename,
    /// Hub is shutting down; clients should reconnect.
    Deinit,
}

/// A broadcast message: `{type, path?, key?, ...extra}`.
///
/// Unknown fields are preserved in `extra` and re-emitted as-is, so a body
/// posted to the `send` route reaches subscribers unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Msg {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Msg {
    pub fn new(kind: MsgKind) -> Self {
        Msg {
            kind,
            path: None,
            key: None,
            extra: Map::new(),
        }
    }

    /// A bare `{type: "change"}`, which makes every page reload.
    pub fn change() -> Self {
        Msg::new(MsgKind::Change)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Builds `{type: "deinit", ...extra}`. A `type` inside `extra` is dropped;
    /// string `path`/`key` entries are lifted into their fields.
    pub fn deinit(mut extra: Map<String, Value>) -> Self {
        extra.remove("type");
        let path = take_str(&mut extra, "path");
        let key = take_str(&mut extra, "key");
        Msg {
            kind: MsgKind::Deinit,
            path,
            key,
            extra,
        }
    }

    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

fn take_str(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    match map.remove(field) {
        Some(Value::String(val)) => Some(val),
        Some(other) => {
            map.insert(field.to_string(), other);
            None
        }
        None => None,
    }
}

/// What a page does in response to a `change` or `rename` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Swap only the stylesheet link pointing at this path.
    Stylesheet(String),
    /// Source maps never affect the rendered page.
    Ignore,
    /// Anything else reloads the whole page.
    Reload,
}

impl Reaction {
    pub fn for_path(path: Option<&str>) -> Self {
        let path = path.unwrap_or_default();
        match ext(path) {
            ".css" => Reaction::Stylesheet(path.to_string()),
            ".map" => Reaction::Ignore,
            _ => Reaction::Reload,
        }
    }
}

/// File extension of the last path segment, including the dot.
///
/// Returns `""` when there is none. A leading dot does not count, so
/// `.gitignore` has no extension, and the extension must consist of word
/// characters only.
pub fn ext(path: &str) -> &str {
    let name_start = path.rfind(|c: char| c == '/' || c == '\\').map_or(0, |idx| idx + 1);
    let name = &path[name_start..];
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let suffix = &name[dot + 1..];
            let is_word = !suffix.is_empty()
                && suffix.chars().all(|c| c.is_alphanumeric() || c == '_');
            if is_word {
                &name[dot..]
            } else {
                ""
            }
        }
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ext_of_last_segment() {
        assert_eq!(ext("styles/main.css"), ".css");
        assert_eq!(ext("/a.b/c.min.js"), ".js");
        assert_eq!(ext("about"), "");
        assert_eq!(ext("dir.v2/about"), "");
        assert_eq!(ext("/.gitignore"), "");
        assert_eq!(ext("archive.tar-gz"), "");
        assert_eq!(ext("trailing/"), "");
    }

    #[test]
    fn deinit_merges_extra_fields() {
        let extra = json!({"foo": 1, "type": "change", "key": "k"});
        let Value::Object(extra) = extra else {
            unreachable!()
        };
        let msg = Msg::deinit(extra);
        assert_eq!(msg.kind, MsgKind::Deinit);
        assert_eq!(msg.key.as_deref(), Some("k"));

        let value: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "deinit", "foo": 1, "key": "k"}));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let msg: Msg = serde_json::from_str(r#"{"type":"change","path":"a.css","extra":[1]}"#).unwrap();
        assert_eq!(msg.path.as_deref(), Some("a.css"));
        assert_eq!(msg.extra.get("extra"), Some(&json!([1])));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Msg>(r#"{"type":"explode"}"#).is_err());
        assert!(serde_json::from_str::<Msg>("[]").is_err());
    }

    #[test]
    fn reaction_depends_on_extension() {
        assert_eq!(
            Reaction::for_path(Some("styles/main.css")),
            Reaction::Stylesheet("styles/main.css".into())
        );
        assert_eq!(Reaction::for_path(Some("main.css.map")), Reaction::Ignore);
        assert_eq!(Reaction::for_path(Some("index.html")), Reaction::Reload);
        assert_eq!(Reaction::for_path(None), Reaction::Reload);
    }
}
