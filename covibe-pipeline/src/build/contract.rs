//! Structural contract for generated feature modules.
//!
//! A module must be well-formed, register itself under the exact module
//! id, expose `createCard`, mark its root with the `card` class and avoid
//! dynamic-execution primitives. A wrong or missing registration is the one
//! violation we repair instead of rejecting.

use std::sync::LazyLock;

use regex::{Captures, Regex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("CODE_EMPTY")]
    Empty,
    #[error("CODE_SYNTAX_ERROR:{0}")]
    Syntax(String),
    #[error("CODE_TOO_SHORT")]
    TooShort,
    #[error("CODE_MISSING_REGISTER_FEATURE")]
    MissingRegistration,
    #[error("CODE_BAD_REGISTER_TARGET")]
    WrongIdentifier,
    #[error("CODE_MISSING_CREATE_CARD")]
    MissingEntryPoint,
    #[error("CODE_MISSING_CARD_CLASS")]
    MissingCardClass,
    #[error("CODE_BLOCKED_API:{0}")]
    BlockedPrimitive(&'static str),
}

const MIN_LEN: usize = 80;

static REGISTER_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(window\.)?registerFeature\s*\(\s*[^,()]+,\s*([^)]+)\)").expect("valid regex")
});
static ANY_REGISTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"registerFeature\s*\(").expect("valid regex"));
static MODULE_TYPE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(const|let|var)\s+moduleType\s*=\s*['"][^'"]+['"]"#).expect("valid regex")
});
static CREATE_CARD_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"function\s+createCard\s*\(|\b(const|let|var)\s+createCard\s*=").expect("valid regex")
});
static CREATE_CARD_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"createCard\s*\(").expect("valid regex"));
static CARD_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"className\s*=\s*['"]card['"]|classList\.add\(\s*['"]card['"]\s*\)"#)
        .expect("valid regex")
});
static BLOCKED: LazyLock<[(Regex, &'static str); 3]> = LazyLock::new(|| {
    [
        (Regex::new(r"\beval\s*\(").expect("valid regex"), "eval"),
        (Regex::new(r"\bnew\s+Function\b").expect("valid regex"), "new Function"),
        (Regex::new(r"document\.write\s*\(").expect("valid regex"), "document.write"),
    ]
});

/// A module that passed the contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub code: String,
    /// The registration had to be rewritten.
    pub repaired: bool,
}

/// Validate provider output, repairing its registration if that is the
/// only thing standing between it and the contract.
pub fn prepare(raw: &str, module_id: &str) -> Result<Prepared, ContractViolation> {
    let code = raw.trim();
    if code.is_empty() {
        return Err(ContractViolation::Empty);
    }
    match validate(code, module_id) {
        Ok(()) => Ok(Prepared {
            code: code.to_string(),
            repaired: false,
        }),
        Err(ContractViolation::WrongIdentifier | ContractViolation::MissingRegistration) => {
            let fixed = repair(code, module_id)?;
            validate(&fixed, module_id)?;
            Ok(Prepared {
                code: fixed,
                repaired: true,
            })
        }
        Err(other) => Err(other),
    }
}

/// Check every rule, reporting the first one violated.
pub fn validate(code: &str, module_id: &str) -> Result<(), ContractViolation> {
    if code.trim().is_empty() {
        return Err(ContractViolation::Empty);
    }
    check_well_formed(code).map_err(ContractViolation::Syntax)?;
    if code.len() < MIN_LEN {
        return Err(ContractViolation::TooShort);
    }
    if !ANY_REGISTER.is_match(code) {
        return Err(ContractViolation::MissingRegistration);
    }
    let exact = Regex::new(&format!(
        r#"registerFeature\s*\(\s*['"]{}['"]"#,
        regex::escape(module_id)
    ))
    .map_err(|e| ContractViolation::Syntax(e.to_string()))?;
    if !exact.is_match(code) {
        return Err(ContractViolation::WrongIdentifier);
    }
    if !CREATE_CARD_REF.is_match(code) {
        return Err(ContractViolation::MissingEntryPoint);
    }
    if !CARD_CLASS.is_match(code) {
        return Err(ContractViolation::MissingCardClass);
    }
    for (re, name) in BLOCKED.iter() {
        if re.is_match(code) {
            return Err(ContractViolation::BlockedPrimitive(name));
        }
    }
    Ok(())
}

/// Rewrite the registration to use `module_id`. Appends a guarded
/// registration when the module defines `createCard` but never registers.
pub fn repair(code: &str, module_id: &str) -> Result<String, ContractViolation> {
    let mut out = REGISTER_CALL
        .replacen(code, 1, |caps: &Captures| {
            let prefix = caps.get(1).map_or("", |m| m.as_str());
            format!("{prefix}registerFeature('{module_id}', {})", &caps[2])
        })
        .into_owned();
    out = MODULE_TYPE_DECL
        .replace_all(&out, |caps: &Captures| {
            format!("{} moduleType = '{module_id}'", &caps[1])
        })
        .into_owned();

    if !ANY_REGISTER.is_match(&out) {
        if !CREATE_CARD_DEF.is_match(&out) {
            return Err(ContractViolation::MissingRegistration);
        }
        out.push_str(&format!(
            "\n\nif (typeof window.registerFeature === 'function') {{\n  window.registerFeature('{module_id}', createCard);\n}}\n"
        ));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Paren,
    Bracket,
    Brace,
    Template,
    TemplateExpr,
}

/// Lexical well-formedness: balanced delimiters, terminated strings,
/// template literals, regex literals and block comments.
pub fn check_well_formed(code: &str) -> Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<(Frame, usize)> = Vec::new();
    let mut line = 1;
    // Last significant character outside strings/comments; decides whether
    // a `/` starts a regex literal or is a division.
    let mut prev: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
        }

        if matches!(stack.last(), Some((Frame::Template, _))) {
            match c {
                '\\' => i += 1,
                '`' => {
                    stack.pop();
                    prev = Some('`');
                }
                '$' if chars.get(i + 1) == Some(&'{') => {
                    stack.push((Frame::TemplateExpr, line));
                    i += 1;
                    prev = Some('{');
                }
                _ => {}
            }
            i += 1;
            continue;
        }

        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated comment from line {start}")),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 1;
                            break;
                        }
                        Some('\n') => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
            '/' if starts_regex(prev) => {
                let start = line;
                let mut in_class = false;
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(format!("unterminated regex on line {start}"));
                        }
                        Some('\\') => i += 1,
                        Some('[') => in_class = true,
                        Some(']') => in_class = false,
                        Some('/') if !in_class => break,
                        _ => {}
                    }
                    i += 1;
                }
                prev = Some('/');
            }
            '\'' | '"' => {
                let start = line;
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(format!("unterminated string on line {start}"));
                        }
                        Some('\\') => i += 1,
                        Some(&q) if q == c => break,
                        _ => {}
                    }
                    i += 1;
                }
                prev = Some(c);
            }
            '`' => {
                stack.push((Frame::Template, line));
                prev = Some('`');
            }
            '(' => stack.push((Frame::Paren, line)),
            '[' => stack.push((Frame::Bracket, line)),
            '{' => stack.push((Frame::Brace, line)),
            ')' | ']' | '}' => {
                let want = match c {
                    ')' => Frame::Paren,
                    ']' => Frame::Bracket,
                    _ => Frame::Brace,
                };
                match stack.pop() {
                    Some((Frame::TemplateExpr, _)) if c == '}' => {}
                    Some((frame, _)) if frame == want => {}
                    Some((_, opened)) => {
                        return Err(format!(
                            "unexpected '{c}' on line {line} (open delimiter from line {opened})"
                        ));
                    }
                    None => return Err(format!("unexpected '{c}' on line {line}")),
                }
            }
            _ => {}
        }
        if !c.is_whitespace() && c != '\'' && c != '"' && c != '/' && c != '`' {
            prev = Some(c);
        }
        i += 1;
    }

    match stack.last() {
        None => Ok(()),
        Some((Frame::Template, opened)) => Err(format!("unterminated template literal from line {opened}")),
        Some((_, opened)) => Err(format!("unclosed delimiter from line {opened}")),
    }
}

fn starts_regex(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(p) => "(,=:[!&|?{};+-*%<>~^".contains(p),
    }
}

/// Escape text for a single-quoted JavaScript string on one line.
fn js_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Collapse to a single line for use in `//` comments.
pub fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Minimal inert module registered under `module_id`. Output depends only
/// on its inputs.
pub fn placeholder(submission_id: i64, request: &str, module_id: &str, reason: &str) -> String {
    let title: String = js_string(&one_line(request)).chars().take(120).collect();
    let title = title.trim_end_matches('\\');
    [
        format!("// Feature {submission_id}: {}", one_line(request)),
        format!("// Fallback placeholder because: {}", one_line(reason)),
        "(function() {".to_string(),
        "  function createCard() {".to_string(),
        "    const card = document.createElement('div');".to_string(),
        "    card.className = 'card';".to_string(),
        "    const title = document.createElement('strong');".to_string(),
        format!("    title.textContent = '{title}';"),
        "    const hint = document.createElement('p');".to_string(),
        "    hint.className = 'placeholder-content';".to_string(),
        "    hint.textContent = 'This feature was created, but its interactive version could not be generated yet.';".to_string(),
        "    const ts = document.createElement('small');".to_string(),
        "    ts.textContent = new Date().toLocaleString();".to_string(),
        "    card.appendChild(title);".to_string(),
        "    card.appendChild(hint);".to_string(),
        "    card.appendChild(ts);".to_string(),
        "    return card;".to_string(),
        "  }".to_string(),
        "  if (typeof window.registerFeature === 'function') {".to_string(),
        format!("    window.registerFeature('{module_id}', createCard);"),
        "  }".to_string(),
        "})();".to_string(),
        String::new(),
    ]
    .join("\n")
}
