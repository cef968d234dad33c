use std::sync::OnceLock;

use regex::Regex;

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC and string sequences (DCS/SOS/PM/APC) run until BEL or ST.
    Str { bel_ends: bool },
    StrEsc { bel_ends: bool },
}

/// Strip terminal escapes and control characters from one line of subprocess
/// output so it can go into a structured log field.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Str { bel_ends: true }),
                (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::Str { bel_ends: false }),
                (Escape::Start, _) => None,
                (Escape::Csi, c) if ('@'..='~').contains(&c) => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Str { bel_ends: true }, '\x07') => None,
                (Escape::Str { bel_ends }, '\x1b') => Some(Escape::StrEsc { bel_ends }),
                (Escape::Str { bel_ends }, _) => Some(Escape::Str { bel_ends }),
                (Escape::StrEsc { .. }, '\\') => None,
                (Escape::StrEsc { bel_ends }, '\x1b') => Some(Escape::StrEsc { bel_ends }),
                (Escape::StrEsc { bel_ends }, _) => Some(Escape::Str { bel_ends }),
            };
            continue;
        }

        let printable = match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\t' => ' ',
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        if kept == MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        out.push(printable);
        kept += 1;
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

fn password_prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Interactive prompt ("user@host's password:") or a batch-mode refusal
        // that lists password among the offered methods.
        Regex::new(r"(?im)(password:|permission denied \([^)]*password[^)]*\))")
            .expect("password prompt pattern is valid")
    })
}

/// True when ssh output shows the remote side wanted password authentication.
pub fn mentions_password_prompt(output: &str) -> bool {
    password_prompt_re().is_match(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colour_and_title_sequences() {
        let input = "sent \u{1b}[32m12\u{1b}[0m bytes\u{1b}]0;rsync\u{7}!";
        assert_eq!(sanitize_line(input), "sent 12 bytes!");
    }

    #[test]
    fn strips_string_sequences_terminated_by_st() {
        assert_eq!(sanitize_line("a\u{1b}Pdata\u{1b}\\b"), "ab");
    }

    #[test]
    fn drops_newlines_and_bidi_marks() {
        assert_eq!(sanitize_line("x\ty\r\n\u{202e}z"), "x yz");
    }

    #[test]
    fn truncates_very_long_lines() {
        let line = "a".repeat(MAX_LINE_CHARS + 50);
        let got = sanitize_line(&line);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < line.len());
    }

    #[test]
    fn detects_interactive_prompt() {
        assert!(mentions_password_prompt("backup@10.0.0.4's password: "));
    }

    #[test]
    fn detects_batch_mode_refusal_offering_password() {
        let out = "backup@nas: Permission denied (publickey,password).\nrsync: connection unexpectedly closed";
        assert!(mentions_password_prompt(out));
    }

    #[test]
    fn ignores_unrelated_failures() {
        assert!(!mentions_password_prompt(
            "ssh: connect to host nas port 22: Connection timed out"
        ));
        assert!(!mentions_password_prompt(
            "backup@nas: Permission denied (publickey)."
        ));
    }
}
