//! Flow translation through gettext PO files.
//!
//! Export walks flow definitions and emits one entry per translatable value:
//! message and voice text, quick replies and category names. Each entry's
//! `msgctxt` locates the value as `{item uuid}/{property}:{index}`, so import
//! writes translations straight back into the definition's `localization`.
//! Case arguments are never exported.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use mailroom_flows::basic::definition::{ActionKind, Definition};
use mailroom_models::Flow;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PoError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("invalid context: {0}")]
    InvalidContext(String),
    #[error("file is for language {found}, not {expected}")]
    LanguageMismatch { expected: String, found: String },
    #[error("unreadable flow definition: {0}")]
    Definition(#[from] serde_json::Error),
}

pub type PoResult<T> = Result<T, PoError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoEntry {
    pub comment: Option<String>,
    pub context: Option<String>,
    pub msgid: String,
    pub msgstr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Po {
    /// Target language, `None` for a template.
    pub language: Option<String>,
    pub entries: Vec<PoEntry>,
}

/// Location of a translatable value inside a flow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Location<'a> {
    item: Uuid,
    property: &'a str,
    index: usize,
}

impl Location<'_> {
    fn context(&self) -> String {
        format!("{}/{}:{}", self.item, self.property, self.index)
    }
}

fn parse_context(context: &str) -> PoResult<(Uuid, &str, usize)> {
    let invalid = || PoError::InvalidContext(context.to_string());
    let (item, rest) = context.split_once('/').ok_or_else(invalid)?;
    let (property, index) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let item = Uuid::parse_str(item).map_err(|_| invalid())?;
    let index = index.parse().map_err(|_| invalid())?;
    if property.is_empty() {
        return Err(invalid());
    }
    Ok((item, property, index))
}

/// Translatable values of a definition, in node order.
fn translatables(definition: &Definition) -> Vec<(Location<'static>, String)> {
    let mut values = Vec::new();
    let mut push = |item: Uuid, property: &'static str, texts: &[String]| {
        for (index, text) in texts.iter().enumerate() {
            if !text.trim().is_empty() {
                values.push((Location { item, property, index }, text.clone()));
            }
        }
    };

    for node in &definition.nodes {
        for action in &node.actions {
            match &action.kind {
                ActionKind::SendMsg {
                    text, quick_replies, ..
                } => {
                    push(action.uuid, "text", std::slice::from_ref(text));
                    push(action.uuid, "quick_replies", quick_replies);
                }
                ActionKind::SayMsg { text } => push(action.uuid, "text", std::slice::from_ref(text)),
                _ => {}
            }
        }
        if let Some(router) = &node.router {
            for category in &router.categories {
                push(category.uuid, "name", std::slice::from_ref(&category.name));
            }
        }
    }
    values
}

/// Build a PO for flows. With a language, existing translations fill
/// `msgstr`; without one the result is a template.
pub fn export(flows: &[Flow], language: Option<&str>) -> PoResult<Po> {
    let mut entries = Vec::new();
    for flow in flows {
        let definition: Definition = serde_json::from_value(flow.definition.clone())?;
        for (location, text) in translatables(&definition) {
            let msgstr = definition
                .localized(language, location.item, location.property)
                .and_then(|values| values.get(location.index))
                .cloned()
                .unwrap_or_default();
            entries.push(PoEntry {
                comment: Some(flow.name.clone()),
                context: Some(location.context()),
                msgid: text,
                msgstr,
            });
        }
    }
    Ok(Po {
        language: language.map(str::to_string),
        entries,
    })
}

/// Write the translations of a PO into the flows that contain its items.
/// Values whose `msgstr` is empty remove the translation. Returns how many
/// item properties were updated.
pub fn import(flows: &mut [Flow], po: &Po, language: &str) -> PoResult<usize> {
    if let Some(found) = &po.language
        && found != language
    {
        return Err(PoError::LanguageMismatch {
            expected: language.to_string(),
            found: found.clone(),
        });
    }

    // item → property → index → translation
    let mut wanted: BTreeMap<Uuid, BTreeMap<String, BTreeMap<usize, String>>> = BTreeMap::new();
    for entry in &po.entries {
        let Some(context) = &entry.context else {
            continue;
        };
        let (item, property, index) = parse_context(context)?;
        wanted
            .entry(item)
            .or_default()
            .entry(property.to_string())
            .or_default()
            .insert(index, entry.msgstr.clone());
    }

    let mut updated = 0;
    let mut known: Vec<Uuid> = Vec::new();
    for flow in flows.iter_mut() {
        let definition: Definition = serde_json::from_value(flow.definition.clone())?;
        let items: Vec<Uuid> = translatables(&definition).iter().map(|(l, _)| l.item).collect();

        for (item, properties) in &wanted {
            if !items.contains(item) {
                continue;
            }
            for (property, values) in properties {
                set_translation(&mut flow.definition, language, *item, property, values);
                updated += 1;
            }
        }
        known.extend(items);
    }

    for item in wanted.keys().filter(|item| !known.contains(item)) {
        warn!(item = %item, "translation for unknown flow item, ignoring");
    }
    Ok(updated)
}

fn set_translation(
    definition: &mut Value,
    language: &str,
    item: Uuid,
    property: &str,
    values: &BTreeMap<usize, String>,
) {
    let item_key = item.to_string();
    if values.values().all(String::is_empty) {
        remove_translation(definition, language, &item_key, property);
        return;
    }

    let len = values.keys().max().map_or(0, |max| max + 1);
    let translated: Vec<Value> = (0..len)
        .map(|i| Value::String(values.get(&i).cloned().unwrap_or_default()))
        .collect();

    let Some(root) = definition.as_object_mut() else {
        return;
    };
    let mut target = root
        .entry("localization")
        .or_insert_with(|| Value::Object(Default::default()));
    for key in [language, item_key.as_str()] {
        let Value::Object(map) = target else {
            return;
        };
        target = map
            .entry(key)
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Value::Object(props) = target {
        props.insert(property.to_string(), Value::Array(translated));
    }
}

fn remove_translation(definition: &mut Value, language: &str, item_key: &str, property: &str) {
    let Some(Value::Object(localization)) = definition.get_mut("localization") else {
        return;
    };
    let Some(Value::Object(lang)) = localization.get_mut(language) else {
        return;
    };
    if let Some(Value::Object(props)) = lang.get_mut(item_key) {
        props.remove(property);
        if props.is_empty() {
            lang.remove(item_key);
        }
    }
    if lang.is_empty() {
        localization.remove(language);
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str, line: usize) -> PoResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            other => {
                return Err(PoError::Syntax {
                    line,
                    message: format!("bad escape: \\{}", other.map(String::from).unwrap_or_default()),
                });
            }
        }
    }
    Ok(out)
}

fn write_field(out: &mut String, keyword: &str, value: &str) {
    if value.contains('\n') {
        let _ = writeln!(out, "{keyword} \"\"");
        for part in value.split_inclusive('\n') {
            let _ = writeln!(out, "\"{}\"", escape(part));
        }
    } else {
        let _ = writeln!(out, "{keyword} \"{}\"", escape(value));
    }
}

impl Po {
    pub fn write(&self) -> String {
        let mut out = String::new();
        out.push_str("# Generated by mailroom\n");
        out.push_str("msgid \"\"\nmsgstr \"\"\n");
        if let Some(language) = &self.language {
            let _ = writeln!(out, "\"Language: {}\\n\"", escape(language));
        }
        out.push_str("\"MIME-Version: 1.0\\n\"\n");
        out.push_str("\"Content-Type: text/plain; charset=UTF-8\\n\"\n");

        for entry in &self.entries {
            out.push('\n');
            if let Some(comment) = &entry.comment {
                let _ = writeln!(out, "#. {comment}");
            }
            if let Some(context) = &entry.context {
                write_field(&mut out, "msgctxt", context);
            }
            write_field(&mut out, "msgid", &entry.msgid);
            write_field(&mut out, "msgstr", &entry.msgstr);
        }
        out
    }

    pub fn parse(text: &str) -> PoResult<Self> {
        #[derive(Clone, Copy, PartialEq)]
        enum Field {
            Context,
            Id,
            Str,
        }

        let mut po = Po::default();
        let mut entry = PoEntry::default();
        let mut has_id = false;
        let mut current: Option<Field> = None;

        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() {
                finish(&mut entry, &mut has_id, &mut po);
                current = None;
                continue;
            }
            if let Some(comment) = line.strip_prefix("#.") {
                if has_id {
                    finish(&mut entry, &mut has_id, &mut po);
                }
                entry.comment = Some(comment.trim().to_string());
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            let (field, rest) = if let Some(rest) = line.strip_prefix("msgctxt ") {
                if has_id {
                    finish(&mut entry, &mut has_id, &mut po);
                }
                (Some(Field::Context), rest)
            } else if let Some(rest) = line.strip_prefix("msgid ") {
                if has_id {
                    finish(&mut entry, &mut has_id, &mut po);
                }
                has_id = true;
                (Some(Field::Id), rest)
            } else if let Some(rest) = line.strip_prefix("msgstr ") {
                if !has_id {
                    return Err(PoError::Syntax {
                        line: line_no,
                        message: "msgstr without msgid".to_string(),
                    });
                }
                (Some(Field::Str), rest)
            } else if line.starts_with('"') {
                (None, line)
            } else {
                return Err(PoError::Syntax {
                    line: line_no,
                    message: format!("unexpected line: {line}"),
                });
            };

            let quoted = rest
                .trim()
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .ok_or_else(|| PoError::Syntax {
                    line: line_no,
                    message: "expected a quoted string".to_string(),
                })?;
            let value = unescape(quoted, line_no)?;

            if let Some(field) = field {
                current = Some(field);
            }
            match current {
                Some(Field::Context) => entry.context.get_or_insert_with(String::new).push_str(&value),
                Some(Field::Id) => entry.msgid.push_str(&value),
                Some(Field::Str) => entry.msgstr.push_str(&value),
                None => {
                    return Err(PoError::Syntax {
                        line: line_no,
                        message: "string outside of an entry".to_string(),
                    });
                }
            }
        }
        finish(&mut entry, &mut has_id, &mut po);
        Ok(po)
    }
}

fn finish(entry: &mut PoEntry, has_id: &mut bool, po: &mut Po) {
    if !*has_id {
        *entry = PoEntry::default();
        return;
    }
    let done = std::mem::take(entry);
    *has_id = false;
    if done.msgid.is_empty() && done.context.is_none() {
        po.language = header_language(&done.msgstr);
    } else {
        po.entries.push(done);
    }
}

fn header_language(header: &str) -> Option<String> {
    header
        .lines()
        .find_map(|line| line.strip_prefix("Language:"))
        .map(|lang| lang.trim().to_string())
        .filter(|lang| !lang.is_empty())
}
