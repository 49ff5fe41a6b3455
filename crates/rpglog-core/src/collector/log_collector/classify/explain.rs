//! `auto_explain` plan extraction.
//!
//! The plan follows `duration: N ms  plan:` either as a JSON document
//! (`auto_explain.log_format = json`) or as indented text.

use serde_json::Value;

use crate::storage::model::{ExplainFormat, ExplainPlan, ExplainSource};

const JSON_QUERY_TEXT_KEY: &str = "Query Text";
const TEXT_QUERY_TEXT_PREFIX: &str = "Query Text:";

/// Extract the query text and plan from the text after `plan:`.
///
/// Returns `None` if the plan is incomplete (log message cut off mid-plan,
/// JSON that does not parse, no `Query Text`).
pub fn parse_auto_explain(plan: &str) -> Option<(String, ExplainPlan)> {
    let trimmed = plan.trim();
    if trimmed.starts_with('{') {
        parse_json_plan(trimmed)
    } else {
        parse_text_plan(plan)
    }
}

fn parse_json_plan(plan: &str) -> Option<(String, ExplainPlan)> {
    let mut value: Value = serde_json::from_str(plan).ok()?;
    let query = match value.as_object_mut()?.remove(JSON_QUERY_TEXT_KEY)? {
        Value::String(q) => q,
        _ => return None,
    };

    // serde_json maps are ordered by key, and to_string emits no whitespace.
    let output = serde_json::to_string(&value).ok()?;

    Some((
        query.trim().to_string(),
        ExplainPlan {
            output,
            format: ExplainFormat::Json,
            source: ExplainSource::AutoExplain,
        },
    ))
}

fn parse_text_plan(plan: &str) -> Option<(String, ExplainPlan)> {
    let mut lines = plan.lines().skip_while(|l| l.trim().is_empty());

    let first = lines.next()?;
    let query_start = first.trim_start().strip_prefix(TEXT_QUERY_TEXT_PREFIX)?;
    let mut query_lines = vec![query_start.trim()];

    let mut plan_lines: Vec<&str> = Vec::new();
    for line in lines {
        if plan_lines.is_empty() && !is_plan_node(line) {
            query_lines.push(line.trim_end());
        } else {
            plan_lines.push(line.trim_end());
        }
    }

    while plan_lines.last().is_some_and(|l| l.trim().is_empty()) {
        plan_lines.pop();
    }
    if plan_lines.is_empty() {
        return None;
    }

    let query = query_lines.join("\n").trim().to_string();
    if query.is_empty() {
        return None;
    }

    Some((
        query,
        ExplainPlan {
            output: dedent(&plan_lines),
            format: ExplainFormat::Text,
            source: ExplainSource::AutoExplain,
        },
    ))
}

/// Plan node lines carry cost or runtime annotations.
fn is_plan_node(line: &str) -> bool {
    line.contains("(cost=") || line.contains("(actual ") || line.trim_start().starts_with("->")
}

fn dedent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_plan() {
        let plan = "\n\t{\n\t  \"Query Text\": \"SELECT 1\",\n\t  \"Plan\": {\n\
                    \t    \"Node Type\": \"Result\",\n\t    \"Startup Cost\": 0.00\n\t  }\n\t}\n";
        let (query, explain) = parse_auto_explain(plan).unwrap();
        assert_eq!(query, "SELECT 1");
        assert_eq!(explain.format, ExplainFormat::Json);
        assert_eq!(explain.source, ExplainSource::AutoExplain);
        assert_eq!(
            explain.output,
            r#"{"Plan":{"Node Type":"Result","Startup Cost":0.0}}"#
        );
    }

    #[test]
    fn test_json_keys_sorted() {
        let plan = r#"{"Query Text": "SELECT 2", "Z": 1, "A": {"y": 2, "b": 3}}"#;
        let (_, explain) = parse_auto_explain(plan).unwrap();
        assert_eq!(explain.output, r#"{"A":{"b":3,"y":2},"Z":1}"#);
    }

    #[test]
    fn test_json_truncated() {
        let plan = "{\n  \"Query Text\": \"SELECT 1\",\n  \"Plan\": {\n    \"Node Type\": \"Res";
        assert!(parse_auto_explain(plan).is_none());
    }

    #[test]
    fn test_text_plan() {
        let plan = "\n\tQuery Text: SELECT * FROM users\n\t  WHERE id = 1\n\
                    \tIndex Scan using users_pkey on users  (cost=0.29..8.30 rows=1 width=40)\n\
                    \t  Index Cond: (id = 1)\n";
        let (query, explain) = parse_auto_explain(plan).unwrap();
        assert_eq!(query, "SELECT * FROM users\n\t  WHERE id = 1");
        assert_eq!(explain.format, ExplainFormat::Text);
        assert_eq!(
            explain.output,
            "Index Scan using users_pkey on users  (cost=0.29..8.30 rows=1 width=40)\n  \
             Index Cond: (id = 1)"
        );
    }

    #[test]
    fn test_text_plan_without_nodes_is_incomplete() {
        assert!(parse_auto_explain("\nQuery Text: SELECT 1\n").is_none());
        assert!(parse_auto_explain("\nSeq Scan on t  (cost=0.00..1.00 rows=1 width=4)").is_none());
    }
}
