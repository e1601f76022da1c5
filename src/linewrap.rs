//! Fixed-form line wrapping for generated Fortran
//!
//! Long statements are broken before the last operator that fits in the
//! column budget, or failing that after the last blank or comma. Every
//! continuation line starts with `     & ` (a marker in column 6).

/// Prefix of a fixed-form continuation line
pub const CONTINUATION: &str = "     & ";

/// Column budget used when none is configured
pub const DEFAULT_WIDTH: usize = 60;

/// Last column a fixed-form compiler reads
pub const MAX_WIDTH: usize = 72;

/// Wrap every line of `code` to at most `width` columns
pub fn wrap_fixed_form(code: &str, width: usize) -> String {
    let mut out = String::with_capacity(code.len() + code.len() / 8);
    for line in code.lines() {
        for piece in wrap_line(line, width) {
            out.push_str(&piece);
            out.push('\n');
        }
    }
    out
}

/// Split one line into an initial line and continuation lines
pub fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let width = width.clamp(CONTINUATION.len() + 8, MAX_WIDTH);
    if line.len() <= width || line.trim_start().starts_with('!') || !line.is_ascii() {
        return vec![line.trim_end().to_string()];
    }

    let indent = line.len() - line.trim_start().len();
    let mut pieces = Vec::new();
    let cut = break_point(&line.as_bytes()[..width], indent + 1);
    pieces.push(line[..cut].trim_end().to_string());

    let room = width - CONTINUATION.len();
    let mut rest = line[cut..].trim_start();
    while rest.len() > room {
        let cut = break_point(&rest.as_bytes()[..room], 1);
        pieces.push(format!("{}{}", CONTINUATION, rest[..cut].trim_end()));
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(format!("{}{}", CONTINUATION, rest));
    }
    pieces
}

/// Where to cut `window`: before the last operator, else after the last
/// blank or comma, else at the end of the window
fn break_point(window: &[u8], start: usize) -> usize {
    let start = start.max(1);
    let len = window.len();

    let operator_at = |i: usize| {
        let c = window[i];
        let prev = window[i - 1];
        let next = window.get(i + 1).copied();
        match c {
            b'+' | b'-' => {
                let exponent = matches!(prev, b'd' | b'e' | b'D' | b'E')
                    && i >= 2
                    && window[i - 2].is_ascii_digit();
                !exponent && prev != b'('
            }
            b'*' => prev != b'*',
            b'/' => prev != b'(' && next != Some(b')') && next != Some(b'='),
            b'=' => !matches!(prev, b'<' | b'>' | b'/' | b'='),
            b'<' | b'>' => true,
            _ => false,
        }
    };

    if let Some(i) = (start..len).rev().find(|&i| operator_at(i)) {
        return i;
    }
    if let Some(i) = (start..len).rev().find(|&i| matches!(window[i], b' ' | b',')) {
        return i + 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_lines_untouched() {
        assert_eq!(wrap_line("      a = b + c", 60), vec!["      a = b + c"]);
    }

    #[test]
    fn test_wraps_before_operators() {
        let line = "      y_delta(1) = a + b + c + d + e + f";
        assert_eq!(
            wrap_line(line, 20),
            vec!["      y_delta(1)", "     & = a + b + c", "     & + d + e + f"]
        );
    }

    #[test]
    fn test_every_piece_fits() {
        let line = format!(
            "      result = {}",
            (0..40).map(|i| format!("x{}", i)).collect::<Vec<_>>().join(" * ")
        );
        let pieces = wrap_line(&line, 60);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.len() <= 60, "{:?} is too long", piece);
        }
        for piece in &pieces[1..] {
            assert!(piece.starts_with(CONTINUATION));
        }
        let joined: String = pieces
            .iter()
            .map(|p| p.trim_start_matches(CONTINUATION).replace(' ', ""))
            .collect();
        assert_eq!(joined, line.replace(' ', ""));
    }

    #[test]
    fn test_does_not_split_tokens() {
        let line = "      x = 1d-3*a**2/b**3<=(-5d0)";
        for piece in wrap_line(line, 15) {
            assert!(!piece.ends_with('*') || !piece.ends_with("**"));
            assert!(!piece.ends_with("1d"));
            assert!(!piece.ends_with('<'));
        }
    }

    #[test]
    fn test_commas_as_fallback() {
        let line = "      w = (/1d0,2d0,3d0,4d0,5d0,6d0,7d0/)";
        let pieces = wrap_line(line, 22);
        assert_eq!(pieces[0], "      w = (/1d0,2d0,");
        assert!(pieces.iter().all(|p| p.len() <= 22));
    }

    #[test]
    fn test_comments_are_kept() {
        let comment = "! a very long comment line that exceeds the configured column budget";
        assert_eq!(wrap_line(comment, 20), vec![comment]);
    }

    #[test]
    fn test_width_never_exceeds_column_72() {
        let line = format!("      y = {}", vec!["a1"; 60].join(" + "));
        for piece in wrap_line(&line, 200) {
            assert!(piece.len() <= MAX_WIDTH, "{:?}", piece);
        }
    }

    #[test]
    fn test_wrap_fixed_form_keeps_line_order() {
        let code = "      a = 1\n      b = alpha + beta + gamma + delta\n";
        let wrapped = wrap_fixed_form(code, 24);
        assert_eq!(
            wrapped,
            "      a = 1\n      b = alpha + beta\n     & + gamma + delta\n"
        );
    }
}
