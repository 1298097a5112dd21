//! Interpretation of raw safeguard model output.
//!
//! Llama Guard style classifiers answer with either
//!
//! ```text
//! safe
//! ```
//!
//! or
//!
//! ```text
//! unsafe
//! S2
//! ```
//!
//! possibly surrounded by whitespace and in any letter case. The harm code is
//! mapped to a human-readable description through [`HarmCategories`].

use crate::{Error, Result, SafetyVerdict};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static HARM_CODE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(S\d{1,2})").expect("harm code pattern is valid"));

/// Lookup table from harm codes (`S1`, `S2`, ...) to descriptions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct HarmCategories(BTreeMap<String, String>);

impl HarmCategories {
    /// The Llama Guard 3 hazard taxonomy.
    pub fn llama_guard_3() -> Self {
        let table = [
            ("S1", "Violent Crimes"),
            ("S2", "Non-Violent Crimes"),
            ("S3", "Sex-Related Crimes"),
            ("S4", "Child Sexual Exploitation"),
            ("S5", "Defamation"),
            ("S6", "Specialized Advice"),
            ("S7", "Privacy"),
            ("S8", "Intellectual Property"),
            ("S9", "Indiscriminate Weapons"),
            ("S10", "Hate"),
            ("S11", "Suicide & Self-Harm"),
            ("S12", "Sexual Content"),
            ("S13", "Elections"),
            ("S14", "Code Interpreter Abuse"),
        ];
        Self(
            table
                .into_iter()
                .map(|(code, description)| (code.to_owned(), description.to_owned()))
                .collect(),
        )
    }

    /// Parses a JSON object of `{"S1": "description", ...}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the document is not such an object or
    /// is empty.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let categories: Self = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("invalid harm category table: {e}")))?;
        if categories.0.is_empty() {
            return Err(Error::validation("harm category table is empty"));
        }
        Ok(categories)
    }

    /// Returns the description for `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SafeguardUnrecognizedCategory`] for unknown codes.
    pub fn describe(&self, code: &str) -> Result<&str> {
        self.0
            .get(code)
            .map(String::as_str)
            .ok_or_else(|| Error::SafeguardUnrecognizedCategory {
                code: code.to_owned(),
            })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for HarmCategories {
    fn default() -> Self {
        Self::llama_guard_3()
    }
}

/// Turns the classifier's text answer into a [`SafetyVerdict`].
///
/// # Errors
///
/// - [`Error::SafeguardResponseParse`] when the first line is neither `safe`
///   nor `unsafe`, or an `unsafe` answer carries no harm code.
/// - [`Error::SafeguardUnrecognizedCategory`] when the harm code is not in
///   `categories`.
pub fn parse_verdict(response: &str, categories: &HarmCategories) -> Result<SafetyVerdict> {
    let normalized = response.trim().to_lowercase();
    let lines: Vec<&str> = normalized.split('\n').map(str::trim).collect();

    match lines.first().copied() {
        Some("safe") => Ok(SafetyVerdict::Safe),
        Some("unsafe") if lines.len() > 1 => {
            let last = lines[lines.len() - 1].to_uppercase();
            let Some(code) = HARM_CODE.captures(&last).and_then(|c| c.get(1)) else {
                return Err(Error::SafeguardResponseParse {
                    response: normalized,
                });
            };
            let description = categories.describe(code.as_str())?;
            Ok(SafetyVerdict::unsafe_with(description))
        }
        _ => Err(Error::SafeguardResponseParse {
            response: normalized,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_with_surrounding_whitespace() {
        let categories = HarmCategories::default();
        assert_eq!(
            parse_verdict("\n\nsafe", &categories).unwrap(),
            SafetyVerdict::Safe
        );
        assert_eq!(
            parse_verdict("  SAFE  ", &categories).unwrap(),
            SafetyVerdict::Safe
        );
    }

    #[test]
    fn unsafe_maps_code_to_description() {
        let categories = HarmCategories::default();
        assert_eq!(
            parse_verdict("\n\nunsafe\nS2", &categories).unwrap(),
            SafetyVerdict::unsafe_with("Non-Violent Crimes")
        );
        assert_eq!(
            parse_verdict("unsafe\ns10", &categories).unwrap(),
            SafetyVerdict::unsafe_with("Hate")
        );
    }

    #[test]
    fn unsafe_with_multiple_codes_uses_the_first_on_the_last_line() {
        let categories = HarmCategories::default();
        assert_eq!(
            parse_verdict("unsafe\nS1,S9", &categories).unwrap(),
            SafetyVerdict::unsafe_with("Violent Crimes")
        );
    }

    #[test]
    fn unknown_code_is_unrecognized() {
        let categories = HarmCategories::default();
        let err = parse_verdict("unsafe\nS42", &categories).unwrap_err();
        assert!(matches!(
            err,
            Error::SafeguardUnrecognizedCategory { ref code } if code == "S42"
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let categories = HarmCategories::default();
        for response in ["", "maybe", "unsafe", "unsafe\nnothing here", "safe-ish\nS1"] {
            assert!(
                matches!(
                    parse_verdict(response, &categories),
                    Err(Error::SafeguardResponseParse { .. })
                ),
                "{response:?} should not parse"
            );
        }
    }

    #[test]
    fn custom_table_from_json() {
        let categories = HarmCategories::from_json_str(r#"{"S1": "Custom"}"#).unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(
            parse_verdict("unsafe\nS1", &categories).unwrap(),
            SafetyVerdict::unsafe_with("Custom")
        );
        assert!(matches!(
            parse_verdict("unsafe\nS2", &categories),
            Err(Error::SafeguardUnrecognizedCategory { .. })
        ));
    }

    #[test]
    fn invalid_tables_are_rejected() {
        assert!(matches!(
            HarmCategories::from_json_str("{}"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            HarmCategories::from_json_str("[1, 2]"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn default_table_is_llama_guard_3() {
        let categories = HarmCategories::default();
        assert_eq!(categories.len(), 14);
        assert_eq!(categories.describe("S14").unwrap(), "Code Interpreter Abuse");
    }
}
