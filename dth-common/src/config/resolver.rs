//! Token and variable substitution over configuration strings.
//!
//! Resolution runs in three passes:
//!
//! 1. `$` substitution with shell-like quoting (`'…'` literal, `"…"` expanded),
//!    the `$/`, `$:` and `$$` escapes, and `$name` / `${name}` references.
//! 2. Registered literal tokens such as `<gethost>`, in registration order.
//! 3. `<file:path>` and `<url:path>` locators, searched across the test
//!    directories, the search roots and finally the test/harness archives.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Maximum nesting of property references before giving up.
pub const MAX_RESOLUTION_DEPTH: usize = 32;

#[cfg(windows)]
const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: char = ':';

/// Source of values for `$name` references.
pub trait PropertyLookup {
    /// Look up and fully resolve `key`. `depth` is the current nesting level.
    fn lookup_property(&self, key: &str, depth: usize) -> Result<Option<String>, ConfigError>;
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// The substitution engine. Cheap to clone and serializable so it can travel
/// inside a configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigResolver {
    tokens: Vec<(String, String)>,
    search_roots: Vec<PathBuf>,
    test_dirs: Vec<PathBuf>,
    test_archive: Option<PathBuf>,
    harness_archive: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-bind) a literal token such as `<gethost>`.
    pub fn register_token(&mut self, token: impl Into<String>, value: impl Into<String>) {
        let token = token.into();
        let value = value.into();
        match self.tokens.iter_mut().find(|(t, _)| *t == token) {
            Some(entry) => entry.1 = value,
            None => self.tokens.push((token, value)),
        }
    }

    pub fn tokens(&self) -> &[(String, String)] {
        &self.tokens
    }

    pub fn add_search_root(&mut self, root: impl Into<PathBuf>) {
        self.search_roots.push(root.into());
    }

    pub fn set_test_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.test_dirs = dirs;
    }

    pub fn set_test_archive(&mut self, archive: Option<PathBuf>) {
        self.test_archive = archive;
    }

    pub fn set_harness_archive(&mut self, archive: Option<PathBuf>) {
        self.harness_archive = archive;
    }

    /// Fully resolve `raw`.
    pub fn resolve(
        &self,
        raw: &str,
        lookup: &dyn PropertyLookup,
        depth: usize,
    ) -> Result<String, ConfigError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(ConfigError::Recursion {
                key: raw.to_string(),
            });
        }
        let substituted = self.substitute(raw, lookup, depth)?;
        let tokenized = self.replace_tokens(substituted);
        let located = self.replace_locators(tokenized)?;
        trace!(raw, resolved = %located, "resolved configuration string");
        Ok(located)
    }

    /// Replace only `$key` / `${key}` references with `replacement`.
    ///
    /// Everything else, including quotes and other escapes, is copied
    /// verbatim so the full [`resolve`](Self::resolve) pass can run later.
    pub fn resolve_reference(&self, raw: &str, key: &str, replacement: &str) -> String {
        let chars: Vec<char> = raw.chars().collect();
        let mut out = String::with_capacity(raw.len());
        let mut in_single = false;
        let mut in_double = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if in_single {
                if c == '\'' {
                    in_single = false;
                }
                out.push(c);
                i += 1;
                continue;
            }
            match c {
                '\'' if !in_double => {
                    in_single = true;
                    out.push(c);
                    i += 1;
                }
                '"' => {
                    in_double = !in_double;
                    out.push(c);
                    i += 1;
                }
                '$' => match chars.get(i + 1).copied() {
                    Some('$') => {
                        out.push_str("$$");
                        i += 2;
                    }
                    Some('{') => {
                        let close = chars[i + 2..].iter().position(|c| *c == '}');
                        match close {
                            Some(rel) => {
                                let end = i + 2 + rel;
                                let name: String = chars[i + 2..end].iter().collect();
                                if name == key {
                                    out.push_str(replacement);
                                } else {
                                    out.extend(&chars[i..=end]);
                                }
                                i = end + 1;
                            }
                            None => {
                                // Left for resolve() to report.
                                out.extend(&chars[i..]);
                                i = chars.len();
                            }
                        }
                    }
                    Some(n) if is_name_char(n) => {
                        let end = scan_name(&chars, i + 1);
                        let name: String = chars[i + 1..end].iter().collect();
                        if name == key {
                            out.push_str(replacement);
                        } else {
                            out.push('$');
                            out.push_str(&name);
                        }
                        i = end;
                    }
                    _ => {
                        out.push('$');
                        i += 1;
                    }
                },
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        out
    }

    fn substitute(
        &self,
        input: &str,
        lookup: &dyn PropertyLookup,
        depth: usize,
    ) -> Result<String, ConfigError> {
        let chars: Vec<(usize, char)> = input.char_indices().collect();
        let mut out = String::with_capacity(input.len());
        let mut quote: Option<char> = None;
        let mut in_word = false;
        let mut i = 0;

        while i < chars.len() {
            let (offset, c) = chars[i];
            if quote == Some('\'') {
                if c == '\'' {
                    quote = None;
                } else {
                    out.push(c);
                }
                i += 1;
                continue;
            }
            match c {
                '\'' if quote.is_none() => {
                    quote = Some('\'');
                    in_word = true;
                    i += 1;
                }
                '"' => {
                    quote = if quote == Some('"') { None } else { Some('"') };
                    in_word = true;
                    i += 1;
                }
                '#' if quote.is_none() && !in_word => {
                    let kept = out.trim_end().len();
                    out.truncate(kept);
                    break;
                }
                ' ' | '\t' if quote.is_none() => {
                    in_word = false;
                    out.push(c);
                    i += 1;
                }
                '$' => {
                    i = self.expand_dollar(input, &chars, i, offset, &mut out, lookup, depth)?;
                    in_word = true;
                }
                _ => {
                    in_word = true;
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_dollar(
        &self,
        input: &str,
        chars: &[(usize, char)],
        i: usize,
        offset: usize,
        out: &mut String,
        lookup: &dyn PropertyLookup,
        depth: usize,
    ) -> Result<usize, ConfigError> {
        let Some(&(_, next)) = chars.get(i + 1) else {
            return Err(ConfigError::format(input, offset, "'$' at end of input"));
        };
        match next {
            '/' => {
                out.push(std::path::MAIN_SEPARATOR);
                Ok(i + 2)
            }
            ':' => {
                out.push(PATH_LIST_SEPARATOR);
                Ok(i + 2)
            }
            '$' => {
                out.push('$');
                Ok(i + 2)
            }
            '{' => {
                let close = chars[i + 2..].iter().position(|(_, c)| *c == '}');
                let Some(rel) = close else {
                    return Err(ConfigError::format(input, offset, "missing '}' after '${'"));
                };
                let end = i + 2 + rel;
                let name: String = chars[i + 2..end].iter().map(|(_, c)| *c).collect();
                if name.is_empty() {
                    return Err(ConfigError::format(input, offset, "empty name in '${}'"));
                }
                self.splice(&name, out, lookup, depth)?;
                Ok(end + 1)
            }
            n if is_name_char(n) => {
                let plain: Vec<char> = chars.iter().map(|(_, c)| *c).collect();
                let end = scan_name(&plain, i + 1);
                let name: String = plain[i + 1..end].iter().collect();
                self.splice(&name, out, lookup, depth)?;
                Ok(end)
            }
            other => Err(ConfigError::format(
                input,
                offset,
                format!("illegal character '{other}' after '$'"),
            )),
        }
    }

    fn splice(
        &self,
        name: &str,
        out: &mut String,
        lookup: &dyn PropertyLookup,
        depth: usize,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup.lookup_property(name, depth + 1)? {
            out.push_str(&value);
        }
        Ok(())
    }

    fn replace_tokens(&self, mut text: String) -> String {
        for (token, value) in &self.tokens {
            if token.is_empty() {
                continue;
            }
            let mut pos = 0;
            while let Some(found) = text[pos..].find(token.as_str()) {
                let start = pos + found;
                text.replace_range(start..start + token.len(), value);
                pos = start + value.len();
            }
        }
        text
    }

    /// Replace `<file:..>` and `<url:..>` forms, pass after pass, until a
    /// pass changes nothing.
    fn replace_locators(&self, mut text: String) -> Result<String, ConfigError> {
        for _ in 0..MAX_RESOLUTION_DEPTH {
            let (next, replaced) = self.replace_locators_once(&text)?;
            if !replaced {
                return Ok(next);
            }
            text = next;
        }
        Err(ConfigError::Recursion { key: text })
    }

    /// One left-to-right pass. A locator whose target still holds another
    /// locator is left for a later pass.
    fn replace_locators_once(&self, text: &str) -> Result<(String, bool), ConfigError> {
        let mut text = text.to_string();
        let mut replaced = false;
        let mut pos = 0;
        loop {
            let Some((start, marker_len, is_url)) = next_locator(&text, pos) else {
                return Ok((text, replaced));
            };
            let Some(rel_end) = text[start..].find('>') else {
                return Err(ConfigError::format(&text, start, "missing '>' in locator"));
            };
            let end = start + rel_end;
            let target = text[start + marker_len..end].trim().to_string();
            if next_locator(&target, 0).is_some() {
                pos = start + 1;
                continue;
            }
            let replacement = if is_url {
                self.locate_url(&target)?
            } else {
                self.locate_file(&target)?
            };
            text.replace_range(start..=end, &replacement);
            pos = start + replacement.len();
            replaced = true;
        }
    }

    /// Search order: absolute path, test directories, search roots.
    pub fn find_file(&self, path: &str) -> Option<PathBuf> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return candidate.exists().then(|| canonical(candidate));
        }
        self.test_dirs
            .iter()
            .chain(self.search_roots.iter())
            .map(|dir| dir.join(candidate))
            .find(|p| p.exists())
            .map(|p| canonical(&p))
    }

    fn locate_file(&self, path: &str) -> Result<String, ConfigError> {
        self.find_file(path)
            .map(|p| p.display().to_string())
            .ok_or_else(|| ConfigError::NotFound {
                kind: "file",
                path: path.to_string(),
            })
    }

    fn locate_url(&self, path: &str) -> Result<String, ConfigError> {
        if let Some(found) = self.find_file(path) {
            return Ok(file_url(&found));
        }
        let entry = path.trim_start_matches('/');
        for archive in [&self.test_archive, &self.harness_archive]
            .into_iter()
            .flatten()
        {
            if archive_contains(archive, entry) {
                return Ok(format!("jar:{}!/{}", file_url(archive), entry));
            }
        }
        Err(ConfigError::NotFound {
            kind: "url",
            path: path.to_string(),
        })
    }
}

fn scan_name(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && is_name_char(chars[end]) {
        end += 1;
    }
    end
}

/// Start, marker length and kind of the first locator at or after `pos`.
fn next_locator(text: &str, pos: usize) -> Option<(usize, usize, bool)> {
    [("<file:", false), ("<url:", true)]
        .iter()
        .filter_map(|(marker, is_url)| {
            text[pos..].find(marker).map(|i| (pos + i, marker.len(), *is_url))
        })
        .min_by_key(|(start, _, _)| *start)
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn file_url(path: &Path) -> String {
    let text = path.display().to_string().replace('\\', "/");
    if text.starts_with('/') {
        format!("file:{text}")
    } else {
        format!("file:/{text}")
    }
}

fn archive_contains(archive: &Path, entry: &str) -> bool {
    let Ok(file) = File::open(archive) else {
        return false;
    };
    let wanted = PathBuf::from(entry);
    let mut tar = tar::Archive::new(file);
    let Ok(entries) = tar.entries() else {
        return false;
    };
    entries.filter_map(Result::ok).any(|e| {
        e.path()
            .map(|p| {
                p.components()
                    .filter(|c| !matches!(c, Component::CurDir))
                    .collect::<PathBuf>()
                    == wanted
            })
            .unwrap_or(false)
    })
}
