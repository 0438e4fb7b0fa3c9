//! SQL tokenizer for the parameter rewriter.
//!
//! Splits statement text into literal runs, host variables, and top-level
//! statement separators. Quoted strings, comments, and dollar-quoted blocks
//! are scanned with a lightweight state machine so markers inside them stay
//! part of the surrounding literal run.

/// One piece of a scanned SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    /// Ordinary SQL text, passed through untouched.
    Literal(&'a str),
    /// A host variable such as `:name`, `$name`, or `@name`, marker included.
    Variable(&'a str),
    /// A top-level `;`.
    Separator,
}

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }

    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len()
        && bytes[idx + 1..=end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}

/// Scan a variable name after its marker. Names are alphanumeric runs, so a
/// bare marker with nothing scannable after it stays literal text.
fn scan_variable(bytes: &[u8], start: usize) -> Option<usize> {
    let mut idx = start;
    while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
        idx += 1;
    }
    if idx == start { None } else { Some(idx) }
}

fn flush<'a>(tokens: &mut Vec<Token<'a>>, sql: &'a str, start: usize, end: usize) {
    if start < end {
        tokens.push(Token::Literal(&sql[start..end]));
    }
}

/// Split `sql` into tokens. The concatenation of all token text (with
/// `Separator` as `;`) reproduces the input exactly.
pub(crate) fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut state = State::Normal;
    let mut run_start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => state = State::BlockComment(1),
                b'$' => {
                    if let Some((tag, advance)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = advance;
                    } else if let Some(end) = scan_variable(bytes, idx + 1) {
                        flush(&mut tokens, sql, run_start, idx);
                        tokens.push(Token::Variable(&sql[idx..end]));
                        run_start = end;
                        idx = end - 1;
                    }
                }
                b':' => {
                    if bytes.get(idx + 1) == Some(&b':') {
                        idx += 1; // a cast, not a variable
                    } else if let Some(end) = scan_variable(bytes, idx + 1) {
                        flush(&mut tokens, sql, run_start, idx);
                        tokens.push(Token::Variable(&sql[idx..end]));
                        run_start = end;
                        idx = end - 1;
                    }
                }
                b'@' => {
                    if let Some(end) = scan_variable(bytes, idx + 1) {
                        flush(&mut tokens, sql, run_start, idx);
                        tokens.push(Token::Variable(&sql[idx..end]));
                        run_start = end;
                        idx = end - 1;
                    }
                }
                b';' => {
                    flush(&mut tokens, sql, run_start, idx);
                    tokens.push(Token::Separator);
                    run_start = idx + 1;
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                } else if is_block_comment_end(bytes, idx) {
                    if depth == 1 {
                        state = State::Normal;
                    } else {
                        state = State::BlockComment(depth - 1);
                    }
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    let tag_len = tag.len();
                    state = State::Normal;
                    idx += tag_len;
                }
            }
        }

        idx += 1;
    }

    flush(&mut tokens, sql, run_start, bytes.len());
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_named_variables() {
        let tokens = tokenize("SELECT :a, $b FROM t");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("SELECT "),
                Token::Variable(":a"),
                Token::Literal(", "),
                Token::Variable("$b"),
                Token::Literal(" FROM t"),
            ]
        );
    }

    #[test]
    fn keeps_casts_in_literal_runs() {
        let tokens = tokenize("SELECT a::int8 FROM t");
        assert_eq!(tokens, vec![Token::Literal("SELECT a::int8 FROM t")]);
    }

    #[test]
    fn cast_after_variable() {
        let tokens = tokenize("SELECT :a::int8");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("SELECT "),
                Token::Variable(":a"),
                Token::Literal("::int8"),
            ]
        );
    }

    #[test]
    fn skips_quoted_and_commented_text() {
        let tokens = tokenize("SELECT ':a' -- :b\n, \":c\" FROM t WHERE x = :d");
        assert!(
            tokens
                .iter()
                .all(|t| !matches!(t, Token::Variable(v) if *v != ":d"))
        );
        assert!(tokens.contains(&Token::Variable(":d")));
    }

    #[test]
    fn skips_dollar_quoted_blocks() {
        let tokens = tokenize("$fn$ :a $fn$ WHERE x = :b");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("$fn$ :a $fn$ WHERE x = "),
                Token::Variable(":b"),
            ]
        );
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        let tokens = tokenize("SELECT 'it''s :a', :b");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("SELECT 'it''s :a', "),
                Token::Variable(":b"),
            ]
        );
    }

    #[test]
    fn separators_surface_at_top_level_only() {
        let tokens = tokenize("SELECT 1; SELECT 2");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("SELECT 1"),
                Token::Separator,
                Token::Literal(" SELECT 2"),
            ]
        );

        let quoted = tokenize("SELECT 'a;b'");
        assert_eq!(quoted, vec![Token::Literal("SELECT 'a;b'")]);
    }

    #[test]
    fn numbered_and_at_variables() {
        let tokens = tokenize("SELECT $1, @x");
        assert_eq!(
            tokens,
            vec![
                Token::Literal("SELECT "),
                Token::Variable("$1"),
                Token::Literal(", "),
                Token::Variable("@x"),
            ]
        );
    }
}
