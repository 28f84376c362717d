//! Flat `key=value` property files.
//!
//! Accepted syntax: `key=value`, `key: value` or `key value`; lines starting
//! with `#` or `!` are comments; a trailing backslash continues the value on
//! the next line. Keys and values are trimmed. Later duplicates win.

use std::collections::BTreeMap;
use std::path::Path;

/// An unordered property bag.
pub type Properties = BTreeMap<String, String>;

/// Parse property text.
pub fn parse_properties(text: &str) -> Properties {
    let mut props = Properties::new();
    let mut pending: Option<String> = None;

    for raw_line in text.lines() {
        let line = match pending.take() {
            Some(mut prefix) => {
                prefix.push_str(raw_line.trim_start());
                prefix
            }
            None => {
                let trimmed = raw_line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    continue;
                }
                trimmed.to_string()
            }
        };

        if let Some(stripped) = continuation(&line) {
            pending = Some(stripped.to_string());
            continue;
        }
        insert_line(&mut props, &line);
    }

    if let Some(line) = pending {
        insert_line(&mut props, &line);
    }
    props
}

/// Read and parse a property file.
pub fn load_properties(path: &Path) -> std::io::Result<Properties> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_properties(&text))
}

/// Odd number of trailing backslashes means the line continues.
fn continuation(line: &str) -> Option<&str> {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    if trailing % 2 == 1 {
        Some(&line[..line.len() - 1])
    } else {
        None
    }
}

fn insert_line(props: &mut Properties, line: &str) {
    let split_at = line.find(['=', ':']).or_else(|| line.find(char::is_whitespace));
    let (key, value) = match split_at {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, ""),
    };
    let key = key.trim();
    if key.is_empty() {
        return;
    }
    props.insert(key.to_string(), value.trim().to_string());
}

/// Parse `key=value` pairs given on a command line.
pub fn parse_assignments<I, S>(args: I) -> Properties
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .filter_map(|arg| {
            let arg = arg.as_ref();
            let arg = arg.strip_prefix("-D").unwrap_or(arg);
            let (k, v) = arg.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_forms() {
        let props = parse_properties(
            "# comment\n! also comment\na=1\nb : two\nc three\n  d =  spaced value  \nempty=\n",
        );
        assert_eq!(props.get("a").map(String::as_str), Some("1"));
        assert_eq!(props.get("b").map(String::as_str), Some("two"));
        assert_eq!(props.get("c").map(String::as_str), Some("three"));
        assert_eq!(props.get("d").map(String::as_str), Some("spaced value"));
        assert_eq!(props.get("empty").map(String::as_str), Some(""));
        assert_eq!(props.len(), 5);
    }

    #[test]
    fn test_continuation_lines_join() {
        let props = parse_properties("opts=-Xmx64m \\\n    -Dfoo=bar\nnext=1");
        assert_eq!(
            props.get("opts").map(String::as_str),
            Some("-Xmx64m -Dfoo=bar")
        );
        assert_eq!(props.get("next").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_escaped_backslash_is_not_continuation() {
        let props = parse_properties("path=c:\\\\\nother=x");
        assert_eq!(props.get("path").map(String::as_str), Some("c:\\\\"));
        assert_eq!(props.get("other").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_later_duplicate_wins() {
        let props = parse_properties("k=1\nk=2");
        assert_eq!(props.get("k").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_parse_assignments_accepts_define_prefix() {
        let props = parse_assignments(["-Dx=1", "y = 2", "novalue", "=orphan"]);
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("x").map(String::as_str), Some("1"));
        assert_eq!(props.get("y").map(String::as_str), Some("2"));
    }
}
