/// Find the next line ending in the input.
///
/// Returns `(line_len, terminator_len)`. Servers are supposed to use `\r\n`,
/// but a bare `\n` is tolerated when reading.
pub(crate) fn find_line(b: &[u8]) -> Option<(usize, usize)> {
    let lf = b.iter().position(|c| *c == b'\n')?;
    if lf > 0 && b[lf - 1] == b'\r' {
        Some((lf - 1, 2))
    } else {
        Some((lf, 1))
    }
}

pub(crate) fn compare_lowercase_ascii(a: &str, lowercased: &str) -> bool {
    if a.len() != lowercased.len() {
        return false;
    }

    for (a, b) in a.chars().zip(lowercased.chars()) {
        if !a.is_ascii() {
            return false;
        }
        let norm = a.to_ascii_lowercase();
        if norm != b {
            return false;
        }
    }

    true
}

/// Split a comma separated header value into trimmed tokens.
pub(crate) fn tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(|v| v.trim()).filter(|v| !v.is_empty())
}
