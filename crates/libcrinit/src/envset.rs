//! Ordered environment sets.
//!
//! Tasks carry an environment fragment that is merged over the global
//! environment before launch. Insertion order is preserved (it is visible to
//! the child process and to `${NAME}` expansion), overwriting a key keeps its
//! position, and storage grows by a fixed increment rather than doubling so
//! that memory use on small embedded targets stays predictable.

use crate::error::{Error, Result};
use crate::lexers::{self, EnvInnerToken, EnvOuterToken};

pub const ENVSET_DEFAULT_CAPACITY: usize = 64;
pub const ENVSET_DEFAULT_INCREMENT: usize = 64;

/// A growable, ordered sequence of `NAME=VALUE` pairs.
#[derive(Debug, Clone)]
pub struct EnvSet {
    entries: Vec<(String, String)>,
    increment: usize,
}

impl Default for EnvSet {
    fn default() -> Self {
        // The defaults cannot fail the non-zero increment check.
        Self::new(ENVSET_DEFAULT_CAPACITY, ENVSET_DEFAULT_INCREMENT).unwrap()
    }
}

impl EnvSet {
    /// Create a set with room for `capacity` entries, growing by `increment`
    /// entries whenever it runs full. A zero increment is rejected.
    pub fn new(capacity: usize, increment: usize) -> Result<Self> {
        if increment == 0 {
            return Err(Error::InvalidInput(
                "environment set increment must be non-zero".into(),
            ));
        }
        let mut entries = Vec::new();
        entries.reserve_exact(capacity);
        Ok(Self { entries, increment })
    }

    /// Set `name` to `value`. An existing key is overwritten in place and
    /// keeps its position; a new key is appended.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_owned();
            return;
        }
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(self.increment);
        }
        self.entries.push((name.to_owned(), value.to_owned()));
    }

    /// Linear lookup by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse a directive of the form `NAME "value"` and set it.
    ///
    /// The value is expanded against the current contents of this set in one
    /// pass: `${NAME}` references resolve to already-set values (or the empty
    /// string), and `\xHH` / `\c` escapes are decoded. This makes directives
    /// like `ENV_SET = PATH "${PATH}:/opt/bin"` build on earlier entries.
    pub fn parse_and_set(&mut self, directive: &str) -> Result<()> {
        let mut cursor = directive;
        let key = loop {
            match lexers::next_env_outer_token(&mut cursor)? {
                EnvOuterToken::Whitespace => continue,
                EnvOuterToken::Key(k) => break k,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "expected environment key in '{directive}', got {other:?}"
                    )));
                }
            }
        };
        let raw_value = loop {
            match lexers::next_env_outer_token(&mut cursor)? {
                EnvOuterToken::Whitespace => continue,
                EnvOuterToken::Value(v) => break v,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "expected quoted value in '{directive}', got {other:?}"
                    )));
                }
            }
        };
        loop {
            match lexers::next_env_outer_token(&mut cursor)? {
                EnvOuterToken::Whitespace => continue,
                EnvOuterToken::End => break,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "trailing garbage after value in '{directive}': {other:?}"
                    )));
                }
            }
        }

        let expanded = self.expand(raw_value)?;
        self.set(key, &expanded);
        Ok(())
    }

    /// Expand a raw value against this set in one pass.
    ///
    /// `${NAME}` references to missing keys expand to the empty string;
    /// escapes produce their decoded characters.
    pub fn expand(&self, raw: &str) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        let mut cursor = raw;
        loop {
            match lexers::next_env_inner_token(&mut cursor)? {
                EnvInnerToken::Copy(c) | EnvInnerToken::Escaped(c) => out.push(c),
                EnvInnerToken::Variable(name) => {
                    if let Some(v) = self.get(name) {
                        out.push_str(v);
                    }
                }
                EnvInnerToken::End => return Ok(out),
            }
        }
    }

    /// Merge `overlay` over this set: overlay entries overwrite or append,
    /// in overlay order. Used to put a task's fragment over the global set.
    pub fn merge_from(&mut self, overlay: &EnvSet) {
        for (k, v) in &overlay.entries {
            self.set(k, v);
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Currently reserved entry slots. Grows in `increment` steps.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut env = EnvSet::new(2, 2).unwrap();
        env.set("A", "1");
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), None);
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut env = EnvSet::new(4, 4).unwrap();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        let order: Vec<_> = env.iter().collect();
        assert_eq!(order, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn growth_uses_fixed_increment() {
        let mut env = EnvSet::new(2, 3).unwrap();
        for i in 0..6 {
            env.set(&format!("K{i}"), "v");
        }
        assert_eq!(env.len(), 6);
        // 2 initial + two increments of 3; a doubling policy would differ.
        assert_eq!(env.capacity(), 8);
    }

    #[test]
    fn zero_increment_rejected() {
        assert!(EnvSet::new(8, 0).is_err());
    }

    #[test]
    fn parse_and_set_directive_form() {
        let mut env = EnvSet::default();
        env.parse_and_set("K \"v\"").unwrap();
        assert_eq!(env.get("K"), Some("v"));
    }

    #[test]
    fn parse_and_set_expands_against_self() {
        let mut env = EnvSet::default();
        env.parse_and_set("PATH \"/bin\"").unwrap();
        env.parse_and_set("PATH \"${PATH}:/opt/bin\"").unwrap();
        assert_eq!(env.get("PATH"), Some("/bin:/opt/bin"));
    }

    #[test]
    fn expansion_of_missing_key_is_empty() {
        let env = EnvSet::default();
        assert_eq!(env.expand("a${NOPE}b").unwrap(), "ab");
    }

    #[test]
    fn escapes_decode() {
        let env = EnvSet::default();
        assert_eq!(env.expand("\\x41\\x42\\\"").unwrap(), "AB\"");
    }

    #[test]
    fn parse_and_set_rejects_garbage() {
        let mut env = EnvSet::default();
        assert!(env.parse_and_set("K \"v\" extra").is_err());
        assert!(env.parse_and_set("\"v\"").is_err());
        assert!(env.parse_and_set("K v").is_err());
    }

    #[test]
    fn duplicate_matches_source() {
        let mut a = EnvSet::default();
        a.set("X", "1");
        a.set("Y", "2");
        let b = a.clone();
        for (k, v) in a.iter() {
            assert_eq!(b.get(k), Some(v));
        }
    }

    #[test]
    fn merge_overlays_in_order() {
        let mut base = EnvSet::default();
        base.set("A", "global");
        base.set("B", "global");
        let mut task = EnvSet::default();
        task.set("B", "task");
        task.set("C", "task");
        base.merge_from(&task);
        let order: Vec<_> = base.iter().collect();
        assert_eq!(
            order,
            vec![("A", "global"), ("B", "task"), ("C", "task")]
        );
    }
}
