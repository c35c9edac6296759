//! Glob patterns used in sandbox filesystem rules.
//!
//! Policy entries such as `**/.env` or `~/.ssh` are either literal paths or
//! globs. Seatbelt needs globs as anchored regular expressions; Bubblewrap
//! can only bind literal paths, so callers use [`is_glob`] to tell the two
//! apart.
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/`
//! - `?` matches one character except `/`
//! - `[...]` is passed through as a character class
//!
//! ```
//! use polyrun::utils::glob::glob_to_regex;
//!
//! let re = glob_to_regex("**/.env")?;
//! assert!(re.is_match("/work/project/.env"));
//! assert!(!re.is_match("/work/project/.envrc"));
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use regex::Regex;

/// True if `pattern` contains glob metacharacters.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Compiles a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let regex_str = glob_to_regex_string(glob)?;
    Regex::new(&regex_str).map_err(|e| anyhow!("Failed to compile glob pattern to regex: {}", e))
}

/// Converts a glob into an anchored regex source string.
fn glob_to_regex_string(glob: &str) -> Result<String> {
    let mut regex = String::from("^");
    let mut chars = glob.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            '*' => {
                if matches!(chars.peek(), Some((_, '*'))) {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            '[' => {
                let close = glob[i..].find(']').ok_or_else(|| {
                    anyhow!(
                        "Unclosed character class '[' at position {} in glob pattern: {}",
                        i,
                        glob
                    )
                })?;
                regex.push_str(&glob[i..i + close + 1]);
                // Skip the rest of the class.
                while let Some((j, _)) = chars.peek() {
                    if *j > i + close {
                        break;
                    }
                    chars.next();
                }
            }
            _ => regex.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4]))),
        }
    }

    regex.push('$');
    Ok(regex)
}
