//! SQL template rendering
//!
//! Templates use `{name}` placeholders. `{{` and `}}` produce literal braces.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Matches an escaped brace or a placeholder
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}").expect("Invalid TOKEN_RE regex"));

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid NAME_RE regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("no value for placeholder {{{0}}}")]
    Missing(String),

    #[error("invalid placeholder {{{0}}}")]
    InvalidName(String),

    #[error("unmatched '{brace}' at byte {offset}")]
    Unmatched { brace: char, offset: usize },
}

/// Substitute every placeholder in `template` with its value from `params`
pub fn render(template: &str, params: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in TOKEN_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_literal(&mut out, &template[last..whole.start()], last)?;
        last = whole.end();

        match caps.get(1) {
            Some(name) => {
                let name = name.as_str();
                if !NAME_RE.is_match(name) {
                    return Err(TemplateError::InvalidName(name.to_string()));
                }
                let value = params
                    .get(name)
                    .ok_or_else(|| TemplateError::Missing(name.to_string()))?;
                out.push_str(value);
            }
            None => out.push_str(&whole.as_str()[..1]),
        }
    }

    push_literal(&mut out, &template[last..], last)?;
    Ok(out)
}

/// Parse `key=value` pairs as given on the command line
pub fn parse_params(pairs: &[String]) -> Result<BTreeMap<String, String>, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| format!("Invalid parameter (expected key=value): {}", pair))
        })
        .collect()
}

fn push_literal(out: &mut String, text: &str, base: usize) -> Result<(), TemplateError> {
    if let Some(pos) = text.find(['{', '}']) {
        return Err(TemplateError::Unmatched {
            brace: text[pos..].chars().next().unwrap_or('{'),
            offset: base + pos,
        });
    }
    out.push_str(text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let sql = render(
            "SELECT * FROM {schema}.{table} WHERE year = {year}",
            &params(&[("schema", "test"), ("table", "reviews"), ("year", "1999")]),
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM test.reviews WHERE year = 1999");
    }

    #[test]
    fn test_render_repeated_placeholder() {
        let sql = render("{a}-{a}", &params(&[("a", "x")])).unwrap();
        assert_eq!(sql, "x-x");
    }

    #[test]
    fn test_render_escaped_braces() {
        let sql = render("SELECT '{{1,2}}'::int[], {n}", &params(&[("n", "3")])).unwrap();
        assert_eq!(sql, "SELECT '{1,2}'::int[], 3");
    }

    #[test]
    fn test_render_missing_value() {
        let err = render("SELECT {x}", &params(&[])).unwrap_err();
        assert_eq!(err, TemplateError::Missing("x".to_string()));
    }

    #[test]
    fn test_render_unmatched_brace() {
        let err = render("SELECT 1 }", &params(&[])).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unmatched {
                brace: '}',
                offset: 9
            }
        );
        assert!(render("SELECT {", &params(&[])).is_err());
    }

    #[test]
    fn test_render_invalid_name() {
        let err = render("{1abc}", &params(&[("1abc", "v")])).unwrap_err();
        assert_eq!(err, TemplateError::InvalidName("1abc".to_string()));
    }

    #[test]
    fn test_render_ignores_unused_params() {
        let sql = render("SELECT 1", &params(&[("unused", "v")])).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_parse_params() {
        let parsed = parse_params(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("x=y"));
        assert!(parse_params(&["nope".to_string()]).is_err());
    }
}
