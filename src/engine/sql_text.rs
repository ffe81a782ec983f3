// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lightweight SQL text handling: named bindings, statement kind and
//! primary table extraction. Not a parser; it only has to skip quoted
//! text and comments correctly.

/// Statement classification by leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
}

impl StatementKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ddl => "ddl",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `sql` and report whether it produces a row set.
#[must_use]
pub fn classify(sql: &str) -> (StatementKind, bool) {
    let code = code_text(sql);
    let words = words(&code);
    let first = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();
    let returning = words.iter().any(|w| w.eq_ignore_ascii_case("RETURNING"));

    match first.as_str() {
        "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "EXPLAIN" => (StatementKind::Select, true),
        "INSERT" | "REPLACE" => (StatementKind::Insert, returning),
        "UPDATE" => (StatementKind::Update, returning),
        "DELETE" => (StatementKind::Delete, returning),
        _ => (StatementKind::Ddl, false),
    }
}

/// Rewrite `:name` placeholders to `?N`.
///
/// Returns the rewritten text and the distinct names in order of first
/// appearance; `?N` indexes into that list (1-based), so a name used twice
/// binds once.
#[must_use]
pub fn rewrite_named(sql: &str) -> (String, Vec<String>) {
    rewrite(sql, true)
}

/// Rewrite `:name` placeholders to plain `?`, for drivers without numbered
/// parameters.
///
/// Returns one name per placeholder, in order, repeats included.
#[must_use]
pub fn rewrite_positional(sql: &str) -> (String, Vec<String>) {
    rewrite(sql, false)
}

fn rewrite(sql: &str, numbered: bool) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' => {
                let end = skip_quoted(&chars, i, ']');
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..].iter().position(|&ch| ch == '\n').map_or(chars.len(), |p| i + p);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = comment_end(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            ':' if chars.get(i + 1).is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_') => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.push('?');
                if numbered {
                    let index = match names.iter().position(|n| *n == name) {
                        Some(pos) => pos + 1,
                        None => {
                            names.push(name);
                            names.len()
                        }
                    };
                    out.push_str(&index.to_string());
                } else {
                    names.push(name);
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, names)
}

/// Index just past the closing delimiter of a quoted run starting at `start`.
fn skip_quoted(chars: &[char], start: usize, close: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            // Doubled quote is an escaped quote
            if close != ']' && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// `sql` with comments blanked and string literals emptied, leaving only
/// keywords and identifiers to look at.
fn code_text(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                out.push_str("''");
                i = skip_quoted(&chars, i, c);
            }
            '"' | '`' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' => {
                let end = skip_quoted(&chars, i, ']');
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                out.push(' ');
                i = chars[i..].iter().position(|&ch| ch == '\n').map_or(chars.len(), |p| i + p);
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push(' ');
                i = comment_end(&chars, i);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the `*/` closing a block comment that opens at `start`.
fn comment_end(chars: &[char], start: usize) -> usize {
    let mut end = start + 2;
    while end < chars.len() && !(chars[end] == '*' && chars.get(end + 1) == Some(&'/')) {
        end += 1;
    }
    (end + 2).min(chars.len())
}

fn words(sql: &str) -> Vec<&str> {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',' || c == ';')
        .filter(|w| !w.is_empty())
        .collect()
}

/// The table a statement primarily reads or writes: the identifier after
/// the first FROM, INTO, UPDATE or TABLE keyword. Empty if none.
#[must_use]
pub fn primary_table_name(sql: &str) -> String {
    let words = words(sql);
    let Some(pos) = words.iter().position(|w| {
        ["FROM", "INTO", "UPDATE", "TABLE"].iter().any(|k| w.eq_ignore_ascii_case(k))
    }) else {
        return String::new();
    };

    let mut rest = words[pos + 1..].iter().copied().filter(|w| {
        !["IF", "NOT", "EXISTS", "OR", "IGNORE", "REPLACE", "ONLY"]
            .iter()
            .any(|k| w.eq_ignore_ascii_case(k))
    });

    rest.next().map(unqualify).unwrap_or_default()
}

fn unqualify(ident: &str) -> String {
    let last = ident.rsplit('.').next().unwrap_or(ident);
    last.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']' || c == '\'')
        .to_string()
}

/// Quote an identifier for SQLite.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
