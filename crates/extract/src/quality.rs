//! Quality scoring (§4.5 stage 2). Deterministic deductions against a
//! base score of 1.0; never produces a negative or >1.0 result.

use once_cell::sync::Lazy;
use regex::Regex;

pub const MIN_TEXT_LENGTH_SUCCESS: usize = 200;

static BOILERPLATE_PHRASES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)accept (all )?cookies",
        r"(?i)subscribe to our newsletter",
        r"(?i)sign up for our newsletter",
        r"(?i)all rights reserved",
        r"(?i)skip to (main )?content",
        r"(?i)loading\.\.\.",
        r"(?i)enable javascript",
        r"(?i)share this (article|post|page)",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static boilerplate pattern"))
    .collect()
});

pub struct QualityResult {
    pub score: f64,
    pub passed: bool,
    pub reasons: Vec<String>,
}

/// Scores extracted `text` against the page's `html_len` and estimated
/// `link_text_len`, per the exact deduction table.
pub fn score(text: &str, has_title: bool, html_len: usize, link_text_len: usize) -> QualityResult {
    let mut score = 1.0_f64;
    let mut reasons = Vec::new();

    let len = text.chars().count();
    if len < MIN_TEXT_LENGTH_SUCCESS {
        score -= 0.4;
        reasons.push("text_too_short".to_string());
    } else if len < 2 * MIN_TEXT_LENGTH_SUCCESS {
        score -= 0.1;
        reasons.push("text_short".to_string());
    }

    let boilerplate_hits = BOILERPLATE_PHRASES
        .iter()
        .map(|re| re.find_iter(text).count())
        .sum::<usize>();
    let boilerplate_density = if len == 0 {
        0.0
    } else {
        boilerplate_hits as f64 / (len as f64 / 500.0).max(1.0)
    };
    if boilerplate_density > 0.3 {
        score -= 0.3;
        reasons.push("high_boilerplate_density".to_string());
    } else if boilerplate_density > 0.15 {
        score -= 0.1;
        reasons.push("moderate_boilerplate_density".to_string());
    }

    let link_density = if len == 0 {
        0.0
    } else {
        link_text_len as f64 / len as f64
    };
    if link_density > 0.5 {
        score -= 0.3;
        reasons.push("high_link_density".to_string());
    } else if link_density > 0.35 {
        score -= 0.1;
        reasons.push("moderate_link_density".to_string());
    }

    if duplicate_line_ratio(text) > 0.2 {
        score -= 0.2;
        reasons.push("duplicate_lines".to_string());
    }

    let html_ratio = if html_len == 0 {
        1.0
    } else {
        len as f64 / html_len as f64
    };
    if html_ratio < 0.05 {
        score -= 0.2;
        reasons.push("low_text_to_html_ratio".to_string());
    }

    if !has_title {
        score -= 0.1;
        reasons.push("missing_title".to_string());
    }

    let score = score.clamp(0.0, 1.0);
    let passed = score >= 0.5 && len >= MIN_TEXT_LENGTH_SUCCESS;

    QualityResult {
        score,
        passed,
        reasons,
    }
}

fn duplicate_line_ratio(text: &str) -> f64 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return 0.0;
    }
    let duplicates = lines.windows(2).filter(|w| w[0] == w[1]).count();
    duplicates as f64 / (lines.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_fails_and_is_penalized() {
        let result = score("too short", true, 1000, 0);
        assert!(!result.passed);
        assert!(result.reasons.contains(&"text_too_short".to_string()));
    }

    #[test]
    fn long_clean_text_passes() {
        let text = "word ".repeat(200);
        let result = score(&text, true, text.len() * 2, 0);
        assert!(result.passed);
        assert!(result.score >= 0.5);
    }

    #[test]
    fn missing_title_deducts_but_can_still_pass() {
        let text = "word ".repeat(200);
        let with_title = score(&text, true, text.len() * 2, 0);
        let without_title = score(&text, false, text.len() * 2, 0);
        assert!(without_title.score < with_title.score);
    }

    #[test]
    fn high_link_density_is_penalized() {
        let text = "word ".repeat(200);
        let result = score(&text, true, text.len() * 2, text.len() * 6 / 10);
        assert!(result.reasons.contains(&"high_link_density".to_string()));
    }

    #[test]
    fn score_never_leaves_unit_interval() {
        let result = score("x", false, 1, 1000);
        assert!((0.0..=1.0).contains(&result.score));
    }
}
