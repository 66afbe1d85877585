//! Bridges the legacy dialect onto the SQLite engine backing the store.
//!
//! Statements are built in the legacy dialect (`[Ident]`, `#date#`). SQLite
//! already understands bracketed identifiers, so the only rewrite needed is
//! turning `#...#` date literals into quoted text. Hash signs inside string
//! literals are left untouched.

use std::borrow::Cow;

pub fn to_sqlite(sql: &str) -> Cow<'_, str> {
    if !sql.contains('#') {
        return Cow::Borrowed(sql);
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if ch == '\'' {
                if chars.get(i + 1) == Some(&'\'') {
                    out.push('\'');
                    i += 1;
                } else {
                    in_string = false;
                }
            }
            i += 1;
            continue;
        }
        match ch {
            '\'' => {
                in_string = true;
                out.push(ch);
            }
            '#' => {
                if let Some(len) = date_literal_len(&chars[i + 1..]) {
                    out.push('\'');
                    out.extend(&chars[i + 1..i + 1 + len]);
                    out.push('\'');
                    i += len + 2;
                    continue;
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
        i += 1;
    }
    Cow::Owned(out)
}

/// Length of the date body if `rest` starts with `yyyy-MM-dd[ HH:mm:ss]#`.
fn date_literal_len(rest: &[char]) -> Option<usize> {
    let end = rest.iter().position(|c| *c == '#')?;
    let body = &rest[..end];
    let looks_like_date = body.len() >= 10
        && body
            .iter()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | ':' | ' '));
    looks_like_date.then_some(end)
}
