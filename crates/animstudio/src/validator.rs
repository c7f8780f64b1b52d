//! Static checks that decide whether a candidate is worth rendering.
//!
//! Validation is pure and fast. It never runs the code; it only rejects
//! sources that would certainly fail to load as a Manim scene.

use regex::Regex;
use std::sync::LazyLock;

use crate::artifact::{CodeArtifact, Diagnostic, Stage};

static MANIM_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:from[ \t]+manim(?:\.[A-Za-z_][A-Za-z0-9_]*)*[ \t]+import\b|import[ \t]+manim\b)")
        .expect("manim import regex")
});

static SCENE_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*class[ \t]+[A-Za-z_][A-Za-z0-9_]*[ \t]*\([^)]*Scene[^)]*\)[ \t]*:")
        .expect("scene class regex")
});

static CONSTRUCT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]+(?:async[ \t]+)?def[ \t]+construct[ \t]*\([ \t]*self\b")
        .expect("construct regex")
});

/// Result of validating a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(Diagnostic),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Validation::Valid => None,
            Validation::Invalid(d) => Some(d),
        }
    }
}

/// True when the source imports Manim in any of the usual forms.
pub fn has_manim_import(source: &str) -> bool {
    MANIM_IMPORT.is_match(source)
}

/// Runs every check in order and reports the first failure.
pub fn validate(code: &CodeArtifact) -> Validation {
    match first_problem(code.source()) {
        None => Validation::Valid,
        Some(message) => Validation::Invalid(Diagnostic::fixable(Stage::Validation, message)),
    }
}

fn first_problem(source: &str) -> Option<String> {
    if source.trim().is_empty() {
        return Some("code is empty".into());
    }
    if !has_manim_import(source) {
        return Some("missing manim import (expected `from manim import *`)".into());
    }
    if !SCENE_CLASS.is_match(source) {
        return Some("no class deriving from a Manim Scene type was found".into());
    }
    if !CONSTRUCT.is_match(source) {
        return Some("the scene class has no `construct(self)` method".into());
    }
    check_delimiters(source).err()
}

/// Checks bracket balance and string termination, skipping the contents of
/// comments and string literals.
fn check_delimiters(source: &str) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let mut open: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                i = skip_string(&chars, i, &mut line)?;
                continue;
            }
            '(' | '[' | '{' => open.push((c, line)),
            ')' | ']' | '}' => match open.pop() {
                Some((opener, _)) if closer_for(opener) == c => {}
                Some((opener, opened_on)) => {
                    return Err(format!(
                        "'{c}' on line {line} does not close '{opener}' opened on line {opened_on}"
                    ));
                }
                None => return Err(format!("unmatched '{c}' on line {line}")),
            },
            _ => {}
        }
        i += 1;
    }

    match open.pop() {
        Some((opener, opened_on)) => Err(format!(
            "'{opener}' opened on line {opened_on} is never closed"
        )),
        None => Ok(()),
    }
}

fn closer_for(opener: char) -> char {
    match opener {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Skips the string literal starting at `start`, returning the index just past
/// its closing quote.
fn skip_string(chars: &[char], start: usize, line: &mut usize) -> Result<usize, String> {
    let quote = chars[start];
    let started_on = *line;
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if chars.get(i + 1) == Some(&'\n') {
                    *line += 1;
                }
                i += 2;
                continue;
            }
            '\n' if !triple => {
                return Err(format!("unterminated string on line {started_on}"));
            }
            '\n' => *line += 1,
            c if c == quote => {
                if !triple {
                    return Ok(i + 1);
                }
                if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                    return Ok(i + 3);
                }
            }
            _ => {}
        }
        i += 1;
    }

    if triple {
        Err(format!(
            "unterminated triple-quoted string starting on line {started_on}"
        ))
    } else {
        Err(format!("unterminated string on line {started_on}"))
    }
}
