use colored::Colorize;
use serde_json::Value;

/// Format pipeline results for the terminal.
/// If `raw_json` is true, output one compact document per line.
pub fn format_results(docs: &[Value], raw_json: bool) -> String {
    if raw_json {
        return docs
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
    }
    if docs.is_empty() {
        return "(empty)".dimmed().to_string();
    }
    let mut lines: Vec<String> = docs.iter().map(pretty_json).collect();
    lines.push(format!("{}", format!("{} document(s)", docs.len()).dimmed()));
    lines.join("\n")
}

/// Format a structured failure `{ok: 0, code, codeName, errmsg}`.
pub fn format_error(failure: &Value, raw_json: bool) -> String {
    if raw_json {
        return failure.to_string();
    }
    let code = failure.get("code").and_then(Value::as_i64).unwrap_or_default();
    let name = failure.get("codeName").and_then(Value::as_str).unwrap_or("Error");
    let msg = failure
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    format!("{} {}", format!("{name} ({code}):").red().bold(), msg.red())
}

/// Format the plan printed by `--explain`.
pub fn format_plan(plan: &Value, raw_json: bool) -> String {
    if raw_json {
        return plan.to_string();
    }
    pretty_json(plan)
}

fn pretty_json(value: &Value) -> String {
    let formatted = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    colorize_json(&formatted)
}

/// Colour a pretty-printed JSON string. A string literal followed by `:` is
/// a key.
fn colorize_json(json_str: &str) -> String {
    let chars: Vec<char> = json_str.chars().collect();
    let mut out = String::with_capacity(json_str.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' => {
                let end = string_end(&chars, i);
                let literal: String = chars[i..end].iter().collect();
                let is_key = chars[end..]
                    .iter()
                    .find(|c| !c.is_whitespace())
                    .is_some_and(|c| *c == ':');
                if is_key {
                    out.push_str(&literal.blue().bold().to_string());
                } else {
                    out.push_str(&literal.green().to_string());
                }
                i = end;
            }
            ':' => {
                out.push_str(&":".dimmed().to_string());
                i += 1;
            }
            '{' | '}' | '[' | ']' | ',' => {
                out.push(ch);
                i += 1;
            }
            _ if ch.is_whitespace() => {
                out.push(ch);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && !is_structural(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(&color_literal(&word));
            }
        }
    }
    out
}

/// Index one past the closing quote of the string starting at `open`.
fn string_end(chars: &[char], open: usize) -> usize {
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn is_structural(c: char) -> bool {
    c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | ',' | ':' | '"')
}

fn color_literal(word: &str) -> String {
    match word {
        "true" | "false" => word.yellow().to_string(),
        "null" => word.dimmed().to_string(),
        _ if word.parse::<f64>().is_ok() => word.cyan().to_string(),
        _ => word.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_output_is_one_document_per_line() {
        let out = format_results(&[json!({"a": 1}), json!({"b": [1, 2]})], true);
        assert_eq!(out, "{\"a\":1}\n{\"b\":[1,2]}");
    }

    #[test]
    fn raw_error_is_the_failure_object() {
        let failure = json!({"ok": 0, "code": 2, "codeName": "BadValue", "errmsg": "x"});
        assert_eq!(format_error(&failure, true), failure.to_string());
    }

    #[test]
    fn escaped_quotes_stay_inside_strings() {
        colored::control::set_override(false);
        let text = r#"{"k\"ey": "v\"al"}"#;
        assert_eq!(colorize_json(text), text);
    }

    #[test]
    fn colorized_json_keeps_text() {
        colored::control::set_override(false);
        let out = pretty_json(&json!({"k": [true, null, 1.5, "s"]}));
        assert_eq!(out, serde_json::to_string_pretty(&json!({"k": [true, null, 1.5, "s"]})).unwrap());
    }
}
