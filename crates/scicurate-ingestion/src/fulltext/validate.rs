//! Structural-completeness check: is fetched text a real article body or just
//! an abstract / landing page?

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// (section, heading pattern). A section counts once however many of its
/// headings appear.
const SECTION_HEADINGS: &[(&str, &str)] = &[
    ("introduction", r"introduction|background"),
    ("methods",      r"materials and methods|methods|methodology|patients and methods|subjects and methods"),
    ("results",      r"results|findings"),
    ("discussion",   r"discussion|conclusions?"),
];

lazy_static! {
    static ref HEADING_REGEXES: Vec<(&'static str, Regex)> = SECTION_HEADINGS
        .iter()
        .map(|(section, pat)| {
            // A heading line: optional numbering, the keyword, then at most a
            // short tail ("Results and analysis", "2. Methods:").
            let re = format!(r"(?mi)^[ \t]*(?:[0-9IVX]+(?:\.[0-9]+)*\.?[ \t]+)?(?:{pat})\b[^\n]{{0,40}}$");
            (*section, Regex::new(&re).expect("static pattern"))
        })
        .collect();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_min_sections")]
    pub min_sections: usize,
}

fn default_min_chars()    -> usize { 2_000 }
fn default_min_sections() -> usize { 2 }

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { min_chars: default_min_chars(), min_sections: default_min_sections() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub chars: usize,
    pub sections: Vec<&'static str>,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct StructuralValidator {
    config: ValidationConfig,
}

impl StructuralValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, text: &str) -> Validation {
        let chars = text.chars().count();
        let sections: Vec<&'static str> = HEADING_REGEXES
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(section, _)| *section)
            .collect();
        let valid = chars >= self.config.min_chars && sections.len() >= self.config.min_sections;
        Validation { chars, sections, valid }
    }
}

impl Default for StructuralValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}
