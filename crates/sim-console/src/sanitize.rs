//! Scrubbing of service-supplied text (labels, config names, validation
//! messages) before it reaches a terminal.

const MAX_CHARS: usize = 512;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Text,
    Esc,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Drop escape sequences, control and bidi characters; fold whitespace
/// controls to a space; cap the length.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_CHARS));
    let mut scan = Scan::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        scan = match (scan, c) {
            (Scan::Text, '\x1b') => Scan::Esc,
            (Scan::Text, '\t' | '\n' | '\r') => {
                if !out.ends_with(' ') {
                    out.push(' ');
                    kept += 1;
                }
                Scan::Text
            }
            (Scan::Text, c) if c.is_control() || is_bidi_control(c) => Scan::Text,
            (Scan::Text, c) => {
                out.push(c);
                kept += 1;
                Scan::Text
            }
            (Scan::Esc, '[') => Scan::Csi,
            (Scan::Esc, ']') => Scan::Osc,
            (Scan::Esc, 'P' | 'X' | '^' | '_') => Scan::String,
            (Scan::Esc, _) => Scan::Text,
            (Scan::Csi, '@'..='~') => Scan::Text,
            (Scan::Csi, _) => Scan::Csi,
            (Scan::Osc, '\x07') => Scan::Text,
            (Scan::Osc | Scan::OscEsc, '\x1b') => Scan::OscEsc,
            (Scan::OscEsc, '\\') => Scan::Text,
            (Scan::Osc | Scan::OscEsc, _) => Scan::Osc,
            (Scan::String | Scan::StringEsc, '\x1b') => Scan::StringEsc,
            (Scan::StringEsc, '\\') => Scan::Text,
            (Scan::String | Scan::StringEsc, _) => Scan::String,
        };
        if kept >= MAX_CHARS {
            out.push_str("...");
            break;
        }
    }

    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out
}
