//! Shell-style key patterns for KEYS.
//!
//! Supported syntax: `*` (any run of characters), `?` (exactly one character),
//! `[abc]`, `[a-z]`, `[!abc]` / `[^abc]` character classes, and `\` to escape the
//! next character. Patterns and keys are matched as UTF-8 text; each byte of an
//! invalid UTF-8 sequence counts as one U+FFFD character.

use std::borrow::Cow;
use std::fmt::Write;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GlobError {
    #[error("empty pattern")]
    Empty,
    #[error("unclosed character class at position {0}")]
    UnclosedClass(usize),
    #[error("empty character class at position {0}")]
    EmptyClass(usize),
    #[error("invalid range {0:?}-{1:?}")]
    InvalidRange(char, char),
    #[error("trailing escape")]
    TrailingEscape,
    #[error("pattern too complex: {0}")]
    Regex(String),
}

#[derive(Debug, Clone)]
pub struct Glob {
    regex: Regex,
}

impl Glob {
    pub fn compile(pattern: &[u8]) -> Result<Self, GlobError> {
        if pattern.is_empty() {
            return Err(GlobError::Empty);
        }
        let chars: Vec<char> = text(pattern).chars().collect();
        let source = translate(&chars)?;
        let regex = Regex::new(&source).map_err(|e| GlobError::Regex(e.to_string()))?;
        Ok(Glob { regex })
    }

    pub fn is_match(&self, key: &[u8]) -> bool {
        self.regex.is_match(&text(key))
    }
}

/// Decodes `raw` as UTF-8, replacing every byte of an invalid sequence with
/// U+FFFD.
fn text(raw: &[u8]) -> Cow<'_, str> {
    if let Ok(valid) = std::str::from_utf8(raw) {
        return Cow::Borrowed(valid);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    let mut rest = raw;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // The prefix was just validated.
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(after.len());
                for _ in 0..bad {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                rest = &after[bad..];
            }
        }
    }
    Cow::Owned(out)
}

fn push_literal(out: &mut String, c: char) {
    // Writing into a String never fails.
    let _ = write!(out, "\\x{{{:X}}}", c as u32);
}

fn translate(pattern: &[char]) -> Result<String, GlobError> {
    let mut out = String::with_capacity(pattern.len() * 8 + 8);
    out.push_str("(?s)^");

    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            '*' => {
                // Collapse runs of stars.
                while i + 1 < pattern.len() && pattern[i + 1] == '*' {
                    i += 1;
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '\\' => {
                i += 1;
                let c = *pattern.get(i).ok_or(GlobError::TrailingEscape)?;
                push_literal(&mut out, c);
            }
            '[' => i = translate_class(pattern, i, &mut out)?,
            c => push_literal(&mut out, c),
        }
        i += 1;
    }

    out.push('$');
    Ok(out)
}

/// Translates the class opening at `start`; returns the index of its closing `]`.
fn translate_class(pattern: &[char], start: usize, out: &mut String) -> Result<usize, GlobError> {
    let mut i = start + 1;
    out.push('[');
    if matches!(pattern.get(i), Some('!') | Some('^')) {
        out.push('^');
        i += 1;
    }

    let mut members = 0;
    loop {
        let mut low = *pattern.get(i).ok_or(GlobError::UnclosedClass(start))?;
        if low == ']' {
            if members == 0 {
                return Err(GlobError::EmptyClass(start));
            }
            break;
        }
        if low == '\\' {
            i += 1;
            low = *pattern.get(i).ok_or(GlobError::TrailingEscape)?;
        }

        let is_range =
            pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).map_or(false, |next| *next != ']');
        if is_range {
            let mut high = pattern[i + 2];
            i += 2;
            if high == '\\' {
                i += 1;
                high = *pattern.get(i).ok_or(GlobError::TrailingEscape)?;
            }
            if low > high {
                return Err(GlobError::InvalidRange(low, high));
            }
            push_literal(out, low);
            out.push('-');
            push_literal(out, high);
        } else {
            push_literal(out, low);
        }
        members += 1;
        i += 1;
    }

    out.push(']');
    Ok(i)
}
