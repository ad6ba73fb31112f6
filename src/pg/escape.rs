//! Quoting of values embedded in generated commands.

/// Turns text into a SQL literal safe to splice into a command.
pub trait Escaper: Send + Sync {
    fn escape(&self, text: &str) -> String;
}

/// Standard-conforming string literal quoting.
///
/// Quotes are doubled; text containing backslashes uses the `E''` form with
/// backslashes doubled too, so the result is valid whatever the server's
/// `standard_conforming_strings` setting.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardEscaper;

impl Escaper for StandardEscaper {
    fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 3);
        if text.contains('\\') {
            out.push('E');
        }
        out.push('\'');
        for c in text.chars() {
            match c {
                '\'' => out.push_str("''"),
                '\\' => out.push_str("\\\\"),
                '\0' => {}
                _ => out.push(c),
            }
        }
        out.push('\'');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain() {
        assert_eq!(StandardEscaper.escape("42_Z3RyaWQ=_YnF1YWw="), "'42_Z3RyaWQ=_YnF1YWw='");
    }

    #[test]
    fn test_quotes_and_backslashes() {
        assert_eq!(StandardEscaper.escape("it's"), "'it''s'");
        assert_eq!(StandardEscaper.escape(r"a\b"), r"E'a\\b'");
    }
}
