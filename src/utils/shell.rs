//! POSIX shell quoting.
//!
//! Sandbox wrappers take a shell command line, so argv has to be turned into
//! one without letting any argument be read as shell syntax. Every word is
//! wrapped in single quotes; embedded single quotes become `'\''`.

/// Quotes one word for `/bin/sh`.
pub fn quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    if word
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Joins argv into a single shell command line.
pub fn join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_unquoted() {
        assert_eq!(quote("/usr/bin/python3"), "/usr/bin/python3");
        assert_eq!(quote("HTTP_PROXY=http://127.0.0.1:8080"), "HTTP_PROXY=http://127.0.0.1:8080");
    }

    #[test]
    fn test_empty_word() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_metacharacters_quoted() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("$HOME"), "'$HOME'");
        assert_eq!(quote("`id`"), "'`id`'");
        assert_eq!(quote("x;rm -rf /"), "'x;rm -rf /'");
        assert_eq!(quote("\"q\""), "'\"q\"'");
    }

    #[test]
    fn test_single_quote_escaped() {
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_join() {
        assert_eq!(
            join(&["python3", "/tmp/my dir/script.py"]),
            "python3 '/tmp/my dir/script.py'"
        );
    }

    #[test]
    fn test_round_trip_through_sh() {
        let tricky = "/tmp/a b/'q'/\"d\"/`x`/$y/${z}/\\n";
        let line = format!("printf '%s' {}", quote(tricky));
        let out = std::process::Command::new("sh")
            .arg("-c")
            .arg(&line)
            .output()
            .expect("sh is available");
        assert_eq!(String::from_utf8_lossy(&out.stdout), tricky);
    }
}
