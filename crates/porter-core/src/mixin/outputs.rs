//! Output extraction and censoring for mixin invocations.
//!
//! A mixin reports outputs two ways. It may print `KEY=VALUE` lines on
//! stdout, and a step may declare outputs that the runtime evaluates after
//! the mixin exits: a file path, a regex over stdout, or a JSONPath over
//! stdout parsed as JSON.

use crate::manifest::StepOutput;
use crate::primitives::REDACTED;
use crate::reference::cached_regex;
use crate::types::{PorterError, Result};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

// =============================================================================
// ASSIGNMENTS
// =============================================================================

fn assignment_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(&RE, r"^([A-Za-z_][A-Za-z0-9_.-]*)=(.*)$")
}

/// Collect `KEY=VALUE` lines. Other lines are ignored and later
/// assignments to the same key win.
pub fn parse_output_assignments(stdout: &str) -> Result<BTreeMap<String, String>> {
    let re = assignment_regex()?;
    let mut outputs = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(caps) = re.captures(line)
            && let (Some(k), Some(v)) = (caps.get(1), caps.get(2))
        {
            outputs.insert(k.as_str().to_string(), v.as_str().to_string());
        }
    }
    Ok(outputs)
}

// =============================================================================
// DECLARED STEP OUTPUTS
// =============================================================================

/// Evaluate the outputs a step declares against what its mixin produced.
///
/// Relative `path` outputs resolve against `working_dir`. An output with no
/// extraction rule is left to the `KEY=VALUE` assignments.
pub fn evaluate_step_outputs(
    declared: &[StepOutput],
    stdout: &str,
    working_dir: &Path,
) -> Result<BTreeMap<String, String>> {
    let mut outputs = BTreeMap::new();
    for output in declared {
        let value = if let Some(path) = output.path.as_deref().filter(|p| !p.is_empty()) {
            let full = working_dir.join(path);
            std::fs::read_to_string(&full).map_err(|e| {
                PorterError::Io(format!(
                    "unable to read output {} from {}: {e}",
                    output.name,
                    full.display()
                ))
            })?
        } else if let Some(pattern) = output.regex.as_deref().filter(|p| !p.is_empty()) {
            regex_output(&output.name, pattern, stdout)?
        } else if let Some(path) = output.json_path.as_deref().filter(|p| !p.is_empty()) {
            json_path_output(&output.name, path, stdout)?
        } else {
            continue;
        };
        outputs.insert(output.name.clone(), value);
    }
    Ok(outputs)
}

/// All matches, newline-joined. The first capture group is used when the
/// pattern has one.
fn regex_output(name: &str, pattern: &str, stdout: &str) -> Result<String> {
    let re = Regex::new(pattern)
        .map_err(|e| PorterError::Validation(format!("invalid regex for output {name}: {e}")))?;
    let matches: Vec<&str> = re
        .captures_iter(stdout)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str())
        .collect();
    Ok(matches.join("\n"))
}

fn json_path_output(name: &str, path: &str, stdout: &str) -> Result<String> {
    let doc: JsonValue = serde_json::from_str(stdout).map_err(|e| {
        PorterError::Serialization(format!("output {name}: stdout is not valid JSON: {e}"))
    })?;
    let selected = select_json_path(&doc, path)
        .map_err(|e| e.context(format!("unable to evaluate jsonPath for output {name}")))?;
    match selected.as_slice() {
        [] => Ok(String::new()),
        [JsonValue::String(s)] => Ok(s.clone()),
        [single] => Ok(single.to_string()),
        many => Ok(JsonValue::Array(many.iter().map(|v| (*v).clone()).collect()).to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

fn parse_json_path(path: &str) -> Result<Vec<Segment>> {
    let invalid = |reason: &str| PorterError::Validation(format!("invalid jsonPath {path:?}: {reason}"));
    let rest = path
        .trim()
        .strip_prefix('$')
        .ok_or_else(|| invalid("must start with $"))?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                let key: String = chars[start..end].iter().collect();
                match key.as_str() {
                    "" => return Err(invalid("empty key")),
                    "*" => segments.push(Segment::Wildcard),
                    _ => segments.push(Segment::Key(key)),
                }
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| i + p)
                    .ok_or_else(|| invalid("unclosed ["))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    let n = inner
                        .parse::<usize>()
                        .map_err(|_| invalid(&format!("unsupported selector [{inner}]")))?;
                    segments.push(Segment::Index(n));
                }
                i = close + 1;
            }
            c => return Err(invalid(&format!("unexpected character {c:?}"))),
        }
    }
    Ok(segments)
}

/// Evaluate the `$`, `.key`, `['key']`, `[n]`, `[*]` subset of JSONPath.
pub fn select_json_path<'v>(doc: &'v JsonValue, path: &str) -> Result<Vec<&'v JsonValue>> {
    let mut current = vec![doc];
    for segment in parse_json_path(path)? {
        let mut next = Vec::new();
        for value in current {
            match (&segment, value) {
                (Segment::Key(k), JsonValue::Object(map)) => next.extend(map.get(k)),
                (Segment::Index(n), JsonValue::Array(items)) => next.extend(items.get(*n)),
                (Segment::Wildcard, JsonValue::Array(items)) => next.extend(items.iter()),
                (Segment::Wildcard, JsonValue::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    Ok(current)
}

// =============================================================================
// CENSORING
// =============================================================================

/// Replaces sensitive values with a fixed mask.
#[derive(Debug, Clone, Default)]
pub struct Censor {
    values: Vec<String>,
}

impl Censor {
    pub fn new(values: &[String]) -> Self {
        let mut values: Vec<String> = values.iter().filter(|v| !v.is_empty()).cloned().collect();
        // Longest first so a value containing another is masked whole.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values.dedup();
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        self.values
            .iter()
            .fold(text.to_string(), |acc, v| acc.replace(v.as_str(), REDACTED))
    }
}

/// A writer that censors complete lines before passing them on.
///
/// Partial lines are buffered until a newline or `flush`, so a value split
/// across two writes is still masked.
pub struct CensoredWriter<W: Write> {
    inner: W,
    censor: Censor,
    pending: Vec<u8>,
}

impl<W: Write> CensoredWriter<W> {
    pub fn new(inner: W, censor: Censor) -> Self {
        Self {
            inner,
            censor,
            pending: Vec::new(),
        }
    }

    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }

    fn emit(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        self.inner.write_all(self.censor.apply(&text).as_bytes())
    }
}

impl<W: Write> Write for CensoredWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
            self.emit(&complete)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest)?;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_output(name: &str) -> StepOutput {
        StepOutput {
            name: name.into(),
            path: None,
            regex: None,
            json_path: None,
        }
    }

    #[test]
    fn assignments() {
        let out = parse_output_assignments("starting\nHOST=db.local\nPORT=3306\r\nnot an output\nHOST=db2\nEMPTY=\n")
            .expect("parse");
        assert_eq!(out.len(), 3);
        assert_eq!(out["HOST"], "db2");
        assert_eq!(out["PORT"], "3306");
        assert_eq!(out["EMPTY"], "");
    }

    #[test]
    fn regex_uses_capture_group() {
        let mut o = step_output("ids");
        o.regex = Some(r"id=(\d+)".into());
        let out = evaluate_step_outputs(&[o], "id=1\nid=22\nnope\n", Path::new(".")).expect("eval");
        assert_eq!(out["ids"], "1\n22");
    }

    #[test]
    fn regex_without_group_uses_match() {
        let mut o = step_output("words");
        o.regex = Some(r"[a-z]+ing".into());
        let out = evaluate_step_outputs(&[o], "sing a song of bring", Path::new(".")).expect("eval");
        assert_eq!(out["words"], "sing\nbring");
    }

    #[test]
    fn path_output_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("token.txt"), "abc").expect("write");
        let mut o = step_output("token");
        o.path = Some("token.txt".into());
        let out = evaluate_step_outputs(&[o.clone()], "", dir.path()).expect("eval");
        assert_eq!(out["token"], "abc");

        o.path = Some("missing.txt".into());
        assert!(evaluate_step_outputs(&[o], "", dir.path()).is_err());
    }

    #[test]
    fn json_path_subset() {
        let doc = json!({"items": [{"name": "a", "port": 1}, {"name": "b", "port": 2}], "meta": {"dash-key": "x"}});
        let names = select_json_path(&doc, "$.items[*].name").expect("select");
        assert_eq!(names, vec![&json!("a"), &json!("b")]);
        assert_eq!(
            select_json_path(&doc, "$.items[1].port").expect("select"),
            vec![&json!(2)]
        );
        assert_eq!(
            select_json_path(&doc, "$.meta['dash-key']").expect("select"),
            vec![&json!("x")]
        );
        assert_eq!(select_json_path(&doc, "$").expect("select"), vec![&doc]);
        assert!(select_json_path(&doc, "items").is_err());
        assert!(select_json_path(&doc, "$.items[?(@.port)]").is_err());
    }

    #[test]
    fn json_path_output_formats() {
        let stdout = r#"{"host": "db", "ports": [1, 2]}"#;
        let mut host = step_output("host");
        host.json_path = Some("$.host".into());
        let mut ports = step_output("ports");
        ports.json_path = Some("$.ports[*]".into());
        let out = evaluate_step_outputs(&[host, ports], stdout, Path::new(".")).expect("eval");
        assert_eq!(out["host"], "db");
        assert_eq!(out["ports"], "[1,2]");
    }

    #[test]
    fn censor_masks_longest_first() {
        let c = Censor::new(&["abc".into(), "abcdef".into(), String::new()]);
        assert_eq!(c.apply("x abcdef y abc"), "x ******* y *******");
        assert!(Censor::new(&[]).is_empty());
    }

    #[test]
    fn censored_writer_masks_split_writes() {
        let mut w = CensoredWriter::new(Vec::new(), Censor::new(&["s3cret".into()]));
        w.write_all(b"password is s3").expect("write");
        w.write_all(b"cret\nbye").expect("write");
        let out = w.into_inner().expect("flush");
        assert_eq!(String::from_utf8(out).expect("utf8"), "password is *******\nbye");
    }
}
