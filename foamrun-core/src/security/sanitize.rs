use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED_PATH]";

// URLs keep their path portion; only bare filesystem paths are sensitive.
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[A-Za-z][A-Za-z0-9+.\-]*://[^\s'"]+"#).unwrap());

// Quoted paths first (they may contain spaces), then unquoted Windows and
// POSIX forms.
static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""(?:[A-Za-z]:[\\/]|/)[^"]*"|'(?:[A-Za-z]:[\\/]|/)[^']*'|[A-Za-z]:\\[^\s,;:'"]+|/[^\s,;:'"]+"#,
    )
    .unwrap()
});

/// Replace filesystem paths in an error message with `[REDACTED_PATH]`
/// while leaving URLs intact. Applied to every container-runtime error
/// before it can reach a client.
pub fn redact_paths(message: &str) -> String {
    let url_spans: Vec<(usize, usize)> = URL_RE
        .find_iter(message)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut out = String::with_capacity(message.len());
    let mut last = 0;
    for m in PATH_RE.find_iter(message) {
        let overlaps_url = url_spans
            .iter()
            .any(|&(s, e)| m.start() < e && m.end() > s);
        if overlaps_url {
            continue;
        }
        out.push_str(&message[last..m.start()]);
        out.push_str(REDACTED);
        last = m.end();
    }
    out.push_str(&message[last..]);
    out
}
