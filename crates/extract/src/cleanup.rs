//! Content cleanup (§4.5 stage 3). A line-oriented regex sweep: strips
//! known boilerplate lines, collapses duplicate consecutive lines, and
//! trims leading/trailing blank lines.

use once_cell::sync::Lazy;
use regex::Regex;

static BOILERPLATE_LINES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^\s*(accept|manage) (all )?cookies\s*$",
        r"(?i)^\s*subscribe (to|for) our newsletter\s*$",
        r"(?i)^\s*share (this|on) (article|post|page|facebook|twitter|x)\s*$",
        r"(?i)^\s*loading\.{2,}\s*$",
        r"(?i)^\s*skip to (main )?content\s*$",
        r"(?i)^\s*all rights reserved\.?\s*$",
        r"(?i)^\s*enable javascript to (view|continue)\.?\s*$",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static cleanup pattern"))
    .collect()
});

pub fn clean(text: &str) -> String {
    let mut lines: Vec<&str> = text
        .lines()
        .filter(|line| !BOILERPLATE_LINES.iter().any(|re| re.is_match(line)))
        .collect();

    let mut deduped: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines.drain(..) {
        if deduped.last().map(|prev| *prev == line).unwrap_or(false) && !line.trim().is_empty() {
            continue;
        }
        deduped.push(line);
    }

    while deduped.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
        deduped.remove(0);
    }
    while deduped.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        deduped.pop();
    }

    deduped.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_boilerplate_lines() {
        let text = "Accept all cookies\nReal content here\nShare this article\n";
        let cleaned = clean(text);
        assert_eq!(cleaned, "Real content here");
    }

    #[test]
    fn collapses_duplicate_consecutive_lines() {
        let text = "same line\nsame line\nsame line\ndifferent";
        let cleaned = clean(text);
        assert_eq!(cleaned, "same line\ndifferent");
    }

    #[test]
    fn trims_leading_and_trailing_blank_lines() {
        let text = "\n\n  \ncontent\n\n";
        let cleaned = clean(text);
        assert_eq!(cleaned, "content");
    }
}
