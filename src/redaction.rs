use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Credential shapes that show up in spreadsheet transport errors, most
/// specific first.
static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9_\-\.=/+]+").expect("valid regex"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r#"(?i)\b(access_token|refresh_token|api[_-]?key|key|token|password|secret)=([^&\s"']+)"#)
                .expect("valid regex"),
            "${1}=[REDACTED]",
        ),
        (
            Regex::new(r"\bya29\.[A-Za-z0-9_\-\.]+").expect("valid regex"),
            "[REDACTED_TOKEN]",
        ),
        (
            Regex::new(r"\bAIza[0-9A-Za-z_\-]{35}\b").expect("valid regex"),
            "[REDACTED_KEY]",
        ),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionResult {
    pub content: String,
    pub redaction_count: usize,
}

/// Scrubs credentials from text before it is stored or logged.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    pub fn redact(&self, input: &str) -> RedactionResult {
        if input.is_empty() {
            return RedactionResult {
                content: String::new(),
                redaction_count: 0,
            };
        }

        let mut result = input.to_string();
        let mut redaction_count = 0usize;

        for (pattern, replacement) in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&result).count();
            if matches == 0 {
                continue;
            }
            redaction_count += matches;
            result = pattern.replace_all(&result, *replacement).to_string();
        }

        if self.aggressive {
            result = result
                .split(' ')
                .map(|word| {
                    if word.len() > 48 && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                        redaction_count += 1;
                        "[REDACTED_LONG_TOKEN]".to_string()
                    } else {
                        word.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        RedactionResult {
            content: result,
            redaction_count,
        }
    }

    pub fn scrub(&self, input: &str) -> String {
        self.redact(input).content
    }
}
