//! Bind parameter extraction from `DETAIL:  parameters: ...` lines.

const PARAMETERS_PREFIX: &str = "parameters: ";

/// Parse `parameters: $1 = 'a', $2 = NULL, ...` into values in `$n` order.
///
/// Quoted values have `''` unescaped to `'`; `NULL` becomes `None`.
/// Returns `None` if `detail` is not a parameters line. Parsing stops at the
/// first malformed entry and keeps everything read before it.
pub fn parse_bind_parameters(detail: &str) -> Option<Vec<Option<String>>> {
    let mut rest = detail.strip_prefix(PARAMETERS_PREFIX)?;
    let mut params = Vec::new();

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some(after_dollar) = rest.strip_prefix('$') else {
            break;
        };
        let digits_end = after_dollar
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_dollar.len());
        if digits_end == 0 {
            break;
        }
        let Some(value_part) = after_dollar[digits_end..].strip_prefix(" = ") else {
            break;
        };

        if let Some(after_null) = value_part.strip_prefix("NULL") {
            params.push(None);
            rest = after_null;
            continue;
        }

        match read_quoted(value_part) {
            Some((value, remaining)) => {
                params.push(Some(value));
                rest = remaining;
            }
            None => break,
        }
    }

    Some(params)
}

/// Read a single-quoted SQL literal from the start of `s`.
fn read_quoted(s: &str) -> Option<(String, &str)> {
    let body = s.strip_prefix('\'')?;
    let mut value = String::new();
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '\'' {
            value.push(c);
            continue;
        }
        if let Some(&(_, '\'')) = chars.peek() {
            chars.next();
            value.push('\'');
            continue;
        }
        return Some((value, &body[i + 1..]));
    }

    // Unterminated literal.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    #[test]
    fn test_parse_simple() {
        assert_eq!(
            parse_bind_parameters("parameters: $1 = 'long string', $2 = '1'"),
            Some(some(&["long string", "1"]))
        );
    }

    #[test]
    fn test_parse_escaped_quotes_and_null() {
        assert_eq!(
            parse_bind_parameters("parameters: $1 = 'it''s', $2 = NULL, $3 = ''''\n"),
            Some(vec![Some("it's".to_string()), None, Some("'".to_string())])
        );
    }

    #[test]
    fn test_parse_value_with_separators() {
        assert_eq!(
            parse_bind_parameters("parameters: $1 = 'a, $2 = ''b''', $2 = 'c'"),
            Some(some(&["a, $2 = 'b'", "c"]))
        );
    }

    #[test]
    fn test_parse_multiline_value() {
        assert_eq!(
            parse_bind_parameters("parameters: $1 = 'line one\nline two'"),
            Some(some(&["line one\nline two"]))
        );
    }

    #[test]
    fn test_not_a_parameters_line() {
        assert_eq!(parse_bind_parameters("Key (id)=(1) already exists."), None);
    }

    #[test]
    fn test_truncated_keeps_prefix() {
        assert_eq!(
            parse_bind_parameters("parameters: $1 = 'x', $2 = 'unterminated"),
            Some(some(&["x"]))
        );
    }
}
