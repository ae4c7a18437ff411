//! Just enough Python lexing to find top-level statements and a trailing
//! `final_answer(...)` call, without a full parser.

use std::borrow::Cow;
use std::ops::Range;

use regex::{Regex, RegexBuilder};

/// Matches a statement that is exactly one `final_answer(...)` call.
pub const FINAL_ANSWER_PATTERN: &str = r"^final_answer\((.*)\)$";

const FINAL_ANSWER_CALLEE: &str = "final_answer";

/// Keywords that open a block whose body can hold `;`-separated statements.
const COMPOUND_KEYWORDS: &[&str] = &[
    "async", "class", "def", "for", "if", "match", "try", "while", "with",
];

/// Keywords that continue the compound statement above them.
const CONTINUATION_KEYWORDS: &[&str] = &["elif", "else", "except", "finally"];

pub fn final_answer_regex() -> Regex {
    RegexBuilder::new(FINAL_ANSWER_PATTERN)
        .dot_matches_new_line(true)
        .build()
        .expect("final answer pattern is valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    /// A byte outside string literals and comments
    Code(usize, u8),
    /// A whole string literal, quotes included
    Str(usize, usize),
}

/// Yields code bytes and string literals; comments and backslash line
/// continuations are skipped.
struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    unterminated: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            unterminated: false,
        }
    }

    fn string(&mut self, start: usize, quote: u8) -> Option<Lexeme> {
        let src = self.src;
        let triple = src[start..].starts_with(&[quote, quote, quote]);
        let mut i = start + if triple { 3 } else { 1 };

        while i < src.len() {
            match src[i] {
                // An escaped character never closes the literal, raw or not
                b'\\' => i += 2,
                b if b == quote && !triple => {
                    self.pos = i + 1;
                    return Some(Lexeme::Str(start, i + 1));
                }
                b if b == quote && src[i..].starts_with(&[quote, quote, quote]) => {
                    self.pos = i + 3;
                    return Some(Lexeme::Str(start, i + 3));
                }
                b'\n' if !triple => break,
                _ => i += 1,
            }
        }

        self.unterminated = true;
        self.pos = src.len();
        None
    }
}

impl Iterator for Lexer<'_> {
    type Item = Lexeme;

    fn next(&mut self) -> Option<Lexeme> {
        loop {
            let start = self.pos;
            let byte = *self.src.get(start)?;
            match byte {
                b'#' => {
                    while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'\\' if self.src[start + 1..].starts_with(b"\n") => self.pos += 2,
                b'\\' if self.src[start + 1..].starts_with(b"\r\n") => self.pos += 3,
                b'\'' | b'"' => return self.string(start, byte),
                _ => {
                    self.pos += 1;
                    return Some(Lexeme::Code(start, byte));
                }
            }
        }
    }
}

/// One logical line: physical lines joined by open brackets or backslashes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogicalLine {
    start: usize,
    /// End of the last code byte (trailing comments and blanks excluded)
    end: usize,
    indent: usize,
    /// Positions of `;` outside any brackets
    semicolons: Vec<usize>,
}

impl LogicalLine {
    fn begin(code: &str, start: usize) -> Self {
        let line_start = code[..start].rfind('\n').map(|p| p + 1).unwrap_or(0);
        Self {
            start,
            end: start,
            indent: start - line_start,
            semicolons: Vec::new(),
        }
    }
}

/// Split `code` into logical lines. `None` when brackets or string
/// literals are unbalanced, which the interpreter will report anyway.
fn logical_lines(code: &str) -> Option<Vec<LogicalLine>> {
    let mut lexer = Lexer::new(code);
    let mut lines = Vec::new();
    let mut current: Option<LogicalLine> = None;
    let mut depth: usize = 0;

    for lexeme in lexer.by_ref() {
        match lexeme {
            Lexeme::Str(start, end) => {
                current
                    .get_or_insert_with(|| LogicalLine::begin(code, start))
                    .end = end;
            }
            Lexeme::Code(_, b'\n') => {
                if depth == 0 {
                    lines.extend(current.take());
                }
            }
            Lexeme::Code(_, b' ' | b'\t' | b'\r' | b'\x0c') => {}
            Lexeme::Code(i, byte) => {
                let line = current.get_or_insert_with(|| LogicalLine::begin(code, i));
                line.end = i + 1;
                match byte {
                    b'(' | b'[' | b'{' => depth += 1,
                    b')' | b']' | b'}' => depth = depth.checked_sub(1)?,
                    b';' if depth == 0 => line.semicolons.push(i),
                    _ => {}
                }
            }
        }
    }

    if lexer.unterminated || depth != 0 {
        return None;
    }
    lines.extend(current.take());
    Some(lines)
}

fn first_word(text: &str) -> &str {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("")
}

fn is_compound(text: &str) -> bool {
    let word = first_word(text);
    text.starts_with('@')
        || (COMPOUND_KEYWORDS.contains(&word) && (word != "match" || text.ends_with(':')))
}

fn push_trimmed(code: &str, range: Range<usize>, statements: &mut Vec<Range<usize>>) {
    let segment = &code[range.clone()];
    let leading = segment.len() - segment.trim_start().len();
    let trailing = segment.len() - segment.trim_end().len();
    if leading + trailing < segment.len() {
        statements.push(range.start + leading..range.end - trailing);
    }
}

/// Byte ranges of the top-level statements of `code`, in order.
///
/// A compound statement spans its whole body (and any `elif`/`else`/
/// `except`/`finally` clauses); decorators belong to what they decorate.
pub(crate) fn top_level_statements(code: &str) -> Option<Vec<Range<usize>>> {
    let mut statements: Vec<Range<usize>> = Vec::new();
    let mut after_decorator = false;

    for line in logical_lines(code)? {
        let text = &code[line.start..line.end];

        let extends_previous = line.indent > 0
            || after_decorator
            || CONTINUATION_KEYWORDS.contains(&first_word(text));
        if extends_previous {
            // Unexpected indentation on the first line is a syntax error
            statements.last_mut()?.end = line.end;
            after_decorator = text.starts_with('@');
            continue;
        }
        after_decorator = text.starts_with('@');

        if line.semicolons.is_empty() || is_compound(text) {
            statements.push(line.start..line.end);
            continue;
        }
        let mut segment_start = line.start;
        for &semicolon in &line.semicolons {
            push_trimmed(code, segment_start..semicolon, &mut statements);
            segment_start = semicolon + 1;
        }
        push_trimmed(code, segment_start..line.end, &mut statements);
    }

    Some(statements)
}

/// A trailing top-level `final_answer(...)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinalAnswerCall<'a> {
    /// Range of the whole call statement in the snippet
    pub statement: Range<usize>,
    /// Source text between the call's parentheses
    pub argument: &'a str,
}

/// Whether the bracket opened at `open` is closed by the last byte of `text`.
fn closes_at_end(text: &str, open: usize) -> bool {
    let mut depth = 0usize;
    for lexeme in Lexer::new(text) {
        let Lexeme::Code(i, byte) = lexeme else {
            continue;
        };
        if i < open {
            continue;
        }
        match byte {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1 == text.len();
                }
            }
            _ => {}
        }
    }
    false
}

/// Find a `final_answer(...)` call forming the last top-level statement.
pub(crate) fn find_final_answer<'a>(code: &'a str, pattern: &Regex) -> Option<FinalAnswerCall<'a>> {
    let statements = top_level_statements(code)?;
    let statement = statements.last()?.clone();
    let text = &code[statement.clone()];

    let argument = pattern.captures(text)?.get(1)?;
    // The pattern is greedy, so `final_answer(a)(b)` would match too
    if !closes_at_end(text, FINAL_ANSWER_CALLEE.len()) {
        return None;
    }

    let start = statement.start + argument.start();
    let end = statement.start + argument.end();
    Some(FinalAnswerCall {
        statement,
        argument: &code[start..end],
    })
}

/// Drop a leading `answer=` keyword from a call argument.
fn strip_answer_keyword(argument: &str) -> &str {
    let Some(rest) = argument.strip_prefix("answer") else {
        return argument;
    };
    let rest = rest.trim_start();
    match rest.strip_prefix('=') {
        Some(value) if !value.starts_with('=') => value.trim_start(),
        _ => argument,
    }
}

/// The lone argument of a call, or `None` when it passes several.
/// A single trailing comma is allowed.
fn single_argument(argument: &str) -> Option<&str> {
    let mut depth: usize = 0;
    let mut comma = None;
    for lexeme in Lexer::new(argument) {
        match lexeme {
            // Anything but blanks after a top-level comma is another argument
            Lexeme::Code(_, b) if comma.is_some() && !b.is_ascii_whitespace() => return None,
            Lexeme::Str(..) if comma.is_some() => return None,
            Lexeme::Code(_, b'(' | b'[' | b'{') => depth += 1,
            Lexeme::Code(_, b')' | b']' | b'}') => depth = depth.saturating_sub(1),
            Lexeme::Code(pos, b',') if depth == 0 => comma = Some(pos),
            _ => {}
        }
    }
    Some(match comma {
        Some(pos) => argument[..pos].trim_end(),
        None => argument,
    })
}

/// What actually gets sent to the sandbox for one submitted snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Submission<'a> {
    pub code: Cow<'a, str>,
    pub is_final_answer: bool,
}

/// Prepare a snippet for the sandbox.
///
/// When the snippet ends in a top-level `final_answer(expr)` call, that
/// statement is replaced by `(expr)` so the interpreter hands back the
/// argument itself as the snippet's value. Everything else is sent verbatim,
/// including calls with more than one argument, which the interpreter rejects.
pub(crate) fn prepare<'a>(code: &'a str, pattern: &Regex) -> Submission<'a> {
    let verbatim = Submission {
        code: Cow::Borrowed(code),
        is_final_answer: false,
    };

    let Some(call) = find_final_answer(code, pattern) else {
        return verbatim;
    };
    let argument = strip_answer_keyword(call.argument.trim());
    // Let the interpreter report a missing or extra argument
    let Some(argument) = single_argument(argument).filter(|a| !a.is_empty()) else {
        return verbatim;
    };

    // Only blanks, comments and `;` can follow the last statement
    let mut rewritten = String::with_capacity(call.statement.start + argument.len() + 4);
    rewritten.push_str(&code[..call.statement.start]);
    rewritten.push_str("(\n");
    rewritten.push_str(argument);
    rewritten.push_str("\n)\n");

    Submission {
        code: Cow::Owned(rewritten),
        is_final_answer: true,
    }
}
