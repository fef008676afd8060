//! Hand-written character-class lexers.
//!
//! Three small lexers drive the text surfaces that are not plain `KEY = VALUE`
//! lines: the kernel command line, the outer shape of `ENV_SET` directives,
//! and the escape/variable syntax inside environment values.
//!
//! Each lexer is a free function taking a cursor (`&mut &str`); it returns the
//! recognized token borrowing from the input and leaves the cursor behind the
//! matched text. The lexers keep no state of their own.

use crate::error::{Error, Result};

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Key characters on the kernel command line additionally allow `.`, as in
/// `crinit.sigkeydir`.
fn is_kcmdline_key_char(c: char) -> bool {
    is_ident_char(c) || c == '.'
}

/// One token of the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCmdlineToken<'a> {
    /// `KEY=VALUE` or `KEY="VALUE WITH SPACES"`. The value excludes the quotes.
    Setting { key: &'a str, value: &'a str },
    Whitespace,
    /// Any character that does not start a setting is passed through.
    Other(&'a str),
    End,
}

/// Lex one token off the kernel command line, advancing `cursor`.
pub fn next_kernel_cmdline_token<'a>(cursor: &mut &'a str) -> Result<KernelCmdlineToken<'a>> {
    let s = *cursor;
    let mut chars = s.char_indices();
    let (_, first) = match chars.next() {
        None => return Ok(KernelCmdlineToken::End),
        Some(c) => c,
    };

    if first.is_ascii_whitespace() {
        let end = s
            .find(|c: char| !c.is_ascii_whitespace())
            .unwrap_or(s.len());
        *cursor = &s[end..];
        return Ok(KernelCmdlineToken::Whitespace);
    }

    if is_ident_start(first) {
        let key_end = s
            .find(|c: char| !is_kcmdline_key_char(c))
            .unwrap_or(s.len());
        let key = &s[..key_end];
        let rest = &s[key_end..];
        if let Some(after_eq) = rest.strip_prefix('=') {
            let (value, consumed) = lex_kcmdline_value(after_eq)?;
            *cursor = &after_eq[consumed..];
            return Ok(KernelCmdlineToken::Setting { key, value });
        }
        // An identifier without `=` is not a setting; pass it through whole.
        *cursor = rest;
        return Ok(KernelCmdlineToken::Other(key));
    }

    // A word that looks like KEY=... but starts with a digit or punctuation is
    // a malformed variable key, not pass-through noise.
    if first.is_ascii_digit() || first.is_ascii_punctuation() {
        let word_end = s
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(s.len());
        let word = &s[..word_end];
        if let Some(eq) = word.find('=') {
            if word[..eq].chars().all(is_kcmdline_key_char) && eq > 0 {
                return Err(Error::InvalidInput(format!(
                    "kernel command line key may not begin with '{first}': {word}"
                )));
            }
        }
    }

    let ch_len = first.len_utf8();
    *cursor = &s[ch_len..];
    Ok(KernelCmdlineToken::Other(&s[..ch_len]))
}

/// Lex the value part after `KEY=`. Returns the value slice (quotes stripped)
/// and the number of bytes consumed.
fn lex_kcmdline_value(s: &str) -> Result<(&str, usize)> {
    if let Some(inner) = s.strip_prefix('"') {
        match inner.find('"') {
            Some(close) => Ok((&inner[..close], close + 2)),
            None => Err(Error::InvalidInput(
                "unterminated quote in kernel command line value".into(),
            )),
        }
    } else {
        let end = s
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(s.len());
        Ok((&s[..end], end))
    }
}

/// One token of the outer `ENV_SET` directive form: `NAME "value"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvOuterToken<'a> {
    /// An environment key: letter/underscore leading, alphanumeric/underscore
    /// following.
    Key(&'a str),
    /// A double-quoted value, quotes stripped but content otherwise raw.
    Value(&'a str),
    Whitespace,
    End,
}

/// Lex one token off an environment directive, advancing `cursor`.
pub fn next_env_outer_token<'a>(cursor: &mut &'a str) -> Result<EnvOuterToken<'a>> {
    let s = *cursor;
    let first = match s.chars().next() {
        None => return Ok(EnvOuterToken::End),
        Some(c) => c,
    };

    if first.is_ascii_whitespace() {
        let end = s
            .find(|c: char| !c.is_ascii_whitespace())
            .unwrap_or(s.len());
        *cursor = &s[end..];
        return Ok(EnvOuterToken::Whitespace);
    }

    if first == '"' {
        // Scan for the closing quote, skipping escaped characters so that a
        // value may contain `\"`.
        let inner = &s[1..];
        let mut iter = inner.char_indices();
        while let Some((i, c)) = iter.next() {
            match c {
                '\\' => {
                    if iter.next().is_none() {
                        return Err(Error::InvalidInput(
                            "trailing backslash in environment value".into(),
                        ));
                    }
                }
                '"' => {
                    *cursor = &inner[i + 1..];
                    return Ok(EnvOuterToken::Value(&inner[..i]));
                }
                _ => {}
            }
        }
        return Err(Error::InvalidInput(
            "unterminated quote in environment value".into(),
        ));
    }

    if is_ident_start(first) {
        let end = s.find(|c: char| !is_ident_char(c)).unwrap_or(s.len());
        *cursor = &s[end..];
        return Ok(EnvOuterToken::Key(&s[..end]));
    }

    Err(Error::InvalidInput(format!(
        "unexpected character '{first}' in environment directive"
    )))
}

/// One token inside an environment value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvInnerToken<'a> {
    /// A plain character, copied through.
    Copy(char),
    /// A decoded escape: `\xHH` yields the code point `HH`, `\c` yields the
    /// literal character `c`.
    Escaped(char),
    /// A `${IDENT}` reference; the slice is the identifier between the braces.
    Variable(&'a str),
    End,
}

/// Lex one token inside an environment value, advancing `cursor`.
pub fn next_env_inner_token<'a>(cursor: &mut &'a str) -> Result<EnvInnerToken<'a>> {
    let s = *cursor;
    let mut chars = s.char_indices();
    let (_, first) = match chars.next() {
        None => return Ok(EnvInnerToken::End),
        Some(c) => c,
    };

    match first {
        '\\' => {
            let (_, esc) = chars.next().ok_or_else(|| {
                Error::InvalidInput("trailing backslash at end of environment value".into())
            })?;
            if esc == 'x' {
                let hex = s.get(2..4).ok_or_else(|| {
                    Error::InvalidInput("truncated \\x escape in environment value".into())
                })?;
                let code = u8::from_str_radix(hex, 16).map_err(|_| {
                    Error::InvalidInput(format!("bad hex digits in \\x escape: {hex}"))
                })?;
                *cursor = &s[4..];
                Ok(EnvInnerToken::Escaped(code as char))
            } else {
                *cursor = &s[1 + esc.len_utf8()..];
                Ok(EnvInnerToken::Escaped(esc))
            }
        }
        '$' if s[1..].starts_with('{') => {
            let inner = &s[2..];
            let close = inner.find('}').ok_or_else(|| {
                Error::InvalidInput("unterminated ${ in environment value".into())
            })?;
            let name = &inner[..close];
            if name.is_empty() || !name.chars().next().map(is_ident_start).unwrap_or(false)
                || !name.chars().all(is_ident_char)
            {
                return Err(Error::InvalidInput(format!(
                    "invalid variable reference ${{{name}}}"
                )));
            }
            *cursor = &inner[close + 1..];
            Ok(EnvInnerToken::Variable(name))
        }
        c => {
            *cursor = &s[c.len_utf8()..];
            Ok(EnvInnerToken::Copy(c))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kcmdline(mut s: &str) -> Vec<KernelCmdlineToken<'_>> {
        let mut out = Vec::new();
        loop {
            let tok = next_kernel_cmdline_token(&mut s).unwrap();
            if tok == KernelCmdlineToken::End {
                return out;
            }
            out.push(tok);
        }
    }

    #[test]
    fn kcmdline_settings_and_quotes() {
        let toks = all_kcmdline("ro crinit.signatures=yes crinit.sigkeydir=\"/etc/my keys\"");
        assert_eq!(
            toks,
            vec![
                KernelCmdlineToken::Other("ro"),
                KernelCmdlineToken::Whitespace,
                KernelCmdlineToken::Setting {
                    key: "crinit.signatures",
                    value: "yes"
                },
                KernelCmdlineToken::Whitespace,
                KernelCmdlineToken::Setting {
                    key: "crinit.sigkeydir",
                    value: "/etc/my keys"
                },
            ]
        );
    }

    #[test]
    fn kcmdline_rejects_digit_leading_key() {
        let mut s = "1abc=val";
        assert!(next_kernel_cmdline_token(&mut s).is_err());
    }

    #[test]
    fn kcmdline_passthrough_for_noise() {
        let toks = all_kcmdline("--");
        assert_eq!(
            toks,
            vec![
                KernelCmdlineToken::Other("-"),
                KernelCmdlineToken::Other("-"),
            ]
        );
    }

    #[test]
    fn kcmdline_unterminated_quote_is_error() {
        let mut s = "key=\"oops";
        assert!(next_kernel_cmdline_token(&mut s).is_err());
    }

    #[test]
    fn env_outer_key_value() {
        let mut s = "FOO \"bar baz\"";
        assert_eq!(next_env_outer_token(&mut s).unwrap(), EnvOuterToken::Key("FOO"));
        assert_eq!(next_env_outer_token(&mut s).unwrap(), EnvOuterToken::Whitespace);
        assert_eq!(
            next_env_outer_token(&mut s).unwrap(),
            EnvOuterToken::Value("bar baz")
        );
        assert_eq!(next_env_outer_token(&mut s).unwrap(), EnvOuterToken::End);
    }

    #[test]
    fn env_outer_rejects_bad_key_start() {
        let mut s = "9LIVES \"no\"";
        assert!(next_env_outer_token(&mut s).is_err());
    }

    #[test]
    fn env_inner_escapes_round_trip() {
        let mut s = "\\x41\\\"x";
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::Escaped('A'));
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::Escaped('"'));
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::Copy('x'));
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::End);
    }

    #[test]
    fn env_inner_variable_reference() {
        let mut s = "a${PATH}b";
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::Copy('a'));
        assert_eq!(
            next_env_inner_token(&mut s).unwrap(),
            EnvInnerToken::Variable("PATH")
        );
        assert_eq!(next_env_inner_token(&mut s).unwrap(), EnvInnerToken::Copy('b'));
    }

    #[test]
    fn env_inner_unterminated_reference_is_error() {
        let mut s = "${OOPS";
        assert!(next_env_inner_token(&mut s).is_err());
    }

    #[test]
    fn env_inner_trailing_backslash_is_error() {
        let mut s = "\\";
        assert!(next_env_inner_token(&mut s).is_err());
    }
}
