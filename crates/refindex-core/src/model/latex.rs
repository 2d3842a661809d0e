//! LaTeX field text to plain Unicode.
//!
//! Records keep LaTeX markup such as `M{\"u}ller` or `Erd\H{o}s`. The index
//! stores a transformed copy next to every literal value so a query typed
//! with real characters finds both spellings.

use unicode_normalization::UnicodeNormalization;

fn accent_mark(command: char) -> Option<char> {
    let mark = match command {
        '"' => '\u{0308}',
        '\'' => '\u{0301}',
        '`' => '\u{0300}',
        '^' => '\u{0302}',
        '~' => '\u{0303}',
        '=' => '\u{0304}',
        '.' => '\u{0307}',
        'u' => '\u{0306}',
        'v' => '\u{030C}',
        'H' => '\u{030B}',
        'c' => '\u{0327}',
        'k' => '\u{0328}',
        'r' => '\u{030A}',
        'd' => '\u{0323}',
        'b' => '\u{0331}',
        _ => return None,
    };
    Some(mark)
}

fn named_symbol(name: &str) -> Option<&'static str> {
    let symbol = match name {
        "ss" => "ß",
        "o" => "ø",
        "O" => "Ø",
        "ae" => "æ",
        "AE" => "Æ",
        "oe" => "œ",
        "OE" => "Œ",
        "aa" => "å",
        "AA" => "Å",
        "l" => "ł",
        "L" => "Ł",
        "i" => "ı",
        "j" => "ȷ",
        _ => return None,
    };
    Some(symbol)
}

/// Replace LaTeX accents, symbols and escapes with Unicode and drop the
/// remaining markup. Plain text comes back unchanged.
pub fn latex_to_unicode(text: &str) -> String {
    if !text.contains(['\\', '{', '}', '~', '-']) {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => i = command(&chars, i + 1, &mut out),
            '{' | '}' => i += 1,
            '~' => {
                out.push(' ');
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                if chars.get(i + 2) == Some(&'-') {
                    out.push('—');
                    i += 3;
                } else {
                    out.push('–');
                    i += 2;
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out.nfc().collect()
}

/// Handle the command starting after a backslash at `i`; returns the index
/// after it.
fn command(chars: &[char], i: usize, out: &mut String) -> usize {
    let Some(&first) = chars.get(i) else {
        return i;
    };
    if matches!(first, '&' | '%' | '_' | '$' | '#' | '{' | '}' | '\\' | ' ') {
        out.push(if first == '\\' { ' ' } else { first });
        return i + 1;
    }

    let (name, mut next) = if first.is_ascii_alphabetic() {
        let end = chars[i..]
            .iter()
            .position(|c| !c.is_ascii_alphabetic())
            .map_or(chars.len(), |n| i + n);
        (chars[i..end].iter().collect::<String>(), end)
    } else {
        (first.to_string(), i + 1)
    };

    let single = name.chars().count() == 1;
    if let Some(mark) = single.then(|| accent_mark(first)).flatten() {
        // Letter accents (\v, \H) need a separator before a bare base.
        while first.is_ascii_alphabetic() && chars.get(next) == Some(&' ') {
            next += 1;
        }
        let (base, after) = accent_base(chars, next);
        if let Some(base) = base {
            out.push(base);
            out.push(mark);
            return after;
        }
    }

    if let Some(symbol) = named_symbol(&name) {
        out.push_str(symbol);
        // `\ss{}` and `\o{}` carry an empty group as terminator.
        if chars.get(next) == Some(&'{') && chars.get(next + 1) == Some(&'}') {
            next += 2;
        } else if chars.get(next) == Some(&' ') {
            next += 1;
        }
        return next;
    }

    // Unknown command: drop the name and keep its argument text.
    if chars.get(next) == Some(&' ') && first.is_ascii_alphabetic() {
        next += 1;
    }
    next
}

/// Base character of an accent, either braced (`{u}`, `{\i}`) or bare.
fn accent_base(chars: &[char], i: usize) -> (Option<char>, usize) {
    match chars.get(i) {
        Some('{') => {
            let mut j = i + 1;
            let base = match chars.get(j) {
                Some('\\') => {
                    let name: String = chars[j + 1..]
                        .iter()
                        .take_while(|c| c.is_ascii_alphabetic())
                        .collect();
                    j += 1 + name.chars().count();
                    match name.as_str() {
                        "i" => Some('i'),
                        "j" => Some('j'),
                        _ => named_symbol(&name).and_then(|s| s.chars().next()),
                    }
                }
                Some('}') | None => None,
                Some(&c) => {
                    j += 1;
                    Some(c)
                }
            };
            if chars.get(j) == Some(&'}') {
                j += 1;
            }
            (base, j)
        }
        Some('\\') => {
            let name: String = chars[i + 1..]
                .iter()
                .take_while(|c| c.is_ascii_alphabetic())
                .collect();
            match name.as_str() {
                "i" => (Some('i'), i + 2),
                "j" => (Some('j'), i + 2),
                _ => (None, i),
            }
        }
        Some(&c) if c.is_alphanumeric() => (Some(c), i + 1),
        _ => (None, i),
    }
}
