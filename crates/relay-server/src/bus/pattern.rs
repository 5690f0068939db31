//! Redis-style glob matching for channel patterns.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes, matching
//! the rules `PSUBSCRIBE` applies to channel names.

/// Whether `channel` matches the glob `pattern`.
pub fn glob_match(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let channel: Vec<char> = channel.chars().collect();
    match_from(&pattern, &channel)
}

fn match_from(mut p: &[char], mut s: &[char]) -> bool {
    // Backtrack point for the most recent `*`: (pattern after star, string position).
    let mut star: Option<(&[char], &[char])> = None;

    loop {
        if let Some((&pc, p_rest)) = p.split_first() {
            if pc == '*' {
                star = Some((p_rest, s));
                p = p_rest;
                continue;
            }
            if let Some((&sc, s_rest)) = s.split_first() {
                if let Some(next_p) = match_one(p, sc) {
                    p = next_p;
                    s = s_rest;
                    continue;
                }
            }
        } else if s.is_empty() {
            return true;
        }

        // Mismatch: let the last `*` swallow one more character.
        match star {
            Some((after_star, consumed)) if !consumed.is_empty() => {
                let advanced = &consumed[1..];
                star = Some((after_star, advanced));
                p = after_star;
                s = advanced;
            }
            _ => return false,
        }
    }
}

/// Match a single non-`*` pattern element against `c`, returning the rest
/// of the pattern on success.
fn match_one(p: &[char], c: char) -> Option<&[char]> {
    match *p.first()? {
        '?' => Some(&p[1..]),
        '\\' if p.len() > 1 => (p[1] == c).then(|| &p[2..]),
        '[' => match_class(&p[1..], c),
        literal => (literal == c).then(|| &p[1..]),
    }
}

fn match_class(mut p: &[char], c: char) -> Option<&[char]> {
    let negate = p.first() == Some(&'^');
    if negate {
        p = &p[1..];
    }
    let mut matched = false;
    loop {
        match p {
            [] => break,
            [']', rest @ ..] => {
                p = rest;
                break;
            }
            ['\\', esc, rest @ ..] => {
                matched |= *esc == c;
                p = rest;
            }
            [lo, '-', hi, rest @ ..] if *hi != ']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&c);
                p = rest;
            }
            [single, rest @ ..] => {
                matched |= *single == c;
                p = rest;
            }
        }
    }
    (matched != negate).then_some(p)
}
