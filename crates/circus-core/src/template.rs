//! Command-line templating.
//!
//! Two token forms are recognised, case-insensitively:
//!
//! - `$(circus.wid)` - the worker id of the process
//! - `$(circus.env.KEY)` - `KEY` looked up in the process's configured
//!   environment (never the daemon's own environment)
//!
//! Substitution runs once, before spawning. The resulting strings are split
//! into words with POSIX-shell-like quoting rules.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

const TOKEN_PATTERN: &str = r"(?i)\$\(circus\.([\w.-]+)\)";

/// Errors that can occur while resolving a template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `$(circus.env.KEY)` names a key absent from the configured env
    #[error("$(circus.env.{key}) is not set in the process environment")]
    MissingEnv { key: String },

    /// A `$(circus.*)` token that is neither `wid` nor `env.KEY`
    #[error("unknown template token $(circus.{token})")]
    UnknownToken { token: String },

    /// Unterminated quote in a command line
    #[error("unbalanced quotes in {input:?}")]
    UnbalancedQuote { input: String },

    /// The token pattern failed to compile
    #[error("invalid template pattern: {0}")]
    Pattern(String),
}

fn token_regex() -> Result<&'static Regex, TemplateError> {
    static TOKEN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    TOKEN
        .get_or_init(|| Regex::new(TOKEN_PATTERN))
        .as_ref()
        .map_err(|e| TemplateError::Pattern(e.to_string()))
}

/// Values available to template tokens.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Worker id
    pub wid: &'a str,
    /// Configured environment
    pub env: &'a BTreeMap<String, String>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(wid: &'a str, env: &'a BTreeMap<String, String>) -> Self {
        Self { wid, env }
    }

    fn lookup_env(&self, key: &str) -> Option<&'a str> {
        if let Some(value) = self.env.get(key) {
            return Some(value.as_str());
        }
        self.env
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn resolve(&self, token: &str) -> Result<&'a str, TemplateError> {
        if token.eq_ignore_ascii_case("wid") {
            return Ok(self.wid);
        }

        let env_key = token
            .get(..4)
            .filter(|prefix| prefix.eq_ignore_ascii_case("env."))
            .and_then(|_| token.get(4..))
            .filter(|key| !key.is_empty());

        match env_key {
            Some(key) => self.lookup_env(key).ok_or_else(|| TemplateError::MissingEnv {
                key: key.to_string(),
            }),
            None => Err(TemplateError::UnknownToken {
                token: token.to_string(),
            }),
        }
    }
}

/// Replaces every `$(circus.*)` token in `input`.
pub fn substitute(input: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let regex = token_regex()?;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in regex.captures_iter(input) {
        let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(input.get(last..whole.start()).unwrap_or_default());
        out.push_str(ctx.resolve(token.as_str())?);
        last = whole.end();
    }
    out.push_str(input.get(last..).unwrap_or_default());

    Ok(out)
}

/// Returns true if `input` contains at least one template token.
pub fn has_tokens(input: &str) -> bool {
    token_regex().is_ok_and(|regex| regex.is_match(input))
}

/// Splits a command line into words.
///
/// Whitespace separates words. Single quotes keep their content literal;
/// double quotes allow `\"`, `\\`, `\$` and `` \` `` escapes; a backslash
/// outside quotes escapes the next character.
pub fn split_words(input: &str) -> Result<Vec<String>, TemplateError> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut state = State::Normal;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '\'' => {
                    state = State::Single;
                    in_word = true;
                }
                '"' => {
                    state = State::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            State::Single => match c {
                '\'' => state = State::Normal,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Normal,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => current.push('\\'),
                },
                c => current.push(c),
            },
        }
    }

    if state != State::Normal {
        return Err(TemplateError::UnbalancedQuote {
            input: input.to_string(),
        });
    }
    if in_word {
        words.push(current);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_wid_and_env() {
        let env = env(&[("type", "macchiato")]);
        let ctx = TemplateContext::new("1", &env);
        let out = substitute("$(circus.wid) --type $(circus.env.type)", &ctx).unwrap();
        assert_eq!(out, "1 --type macchiato");
    }

    #[test]
    fn test_tokens_are_case_insensitive() {
        let env = env(&[("type", "latte")]);
        let ctx = TemplateContext::new("7", &env);
        assert_eq!(substitute("yeah $(CIRCUS.WID)", &ctx).unwrap(), "yeah 7");
        assert_eq!(substitute("$(Circus.Env.TYPE)", &ctx).unwrap(), "latte");
    }

    #[test]
    fn test_missing_env_is_an_error() {
        let env = BTreeMap::new();
        let ctx = TemplateContext::new("1", &env);
        assert_eq!(
            substitute("$(circus.env.PATH)", &ctx),
            Err(TemplateError::MissingEnv {
                key: "PATH".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_token_is_an_error() {
        let env = BTreeMap::new();
        let ctx = TemplateContext::new("1", &env);
        assert!(matches!(
            substitute("$(circus.pid)", &ctx),
            Err(TemplateError::UnknownToken { .. })
        ));
        assert!(matches!(
            substitute("$(circus.env.)", &ctx),
            Err(TemplateError::UnknownToken { .. })
        ));
    }

    #[test]
    fn test_text_without_tokens_is_untouched() {
        let env = BTreeMap::new();
        let ctx = TemplateContext::new("1", &env);
        assert_eq!(substitute("echo $HOME $(date)", &ctx).unwrap(), "echo $HOME $(date)");
        assert!(!has_tokens("echo $HOME"));
        assert!(has_tokens("run $(circus.wid)"));
    }

    #[test]
    fn test_split_words_quoting() {
        assert_eq!(
            split_words(r#"cmd 'a b' "c \"d\"" e\ f"#).unwrap(),
            vec!["cmd", "a b", "c \"d\"", "e f"]
        );
        assert_eq!(split_words("  spaced   out  ").unwrap(), vec!["spaced", "out"]);
        assert_eq!(split_words("empty ''").unwrap(), vec!["empty", ""]);
        assert!(split_words("").unwrap().is_empty());
    }

    #[test]
    fn test_split_words_unbalanced() {
        assert!(matches!(
            split_words("echo 'oops"),
            Err(TemplateError::UnbalancedQuote { .. })
        ));
        assert!(matches!(
            split_words("echo \"oops"),
            Err(TemplateError::UnbalancedQuote { .. })
        ));
    }
}
