//! Claim extraction: deterministic sentence-level splitting of a response
//!
//! Citation decorations are stripped first so that verification sees the
//! same surface the NLI model was trained on.

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use super::hardener::{EXACT_LINE_PREFIX, REFUSAL_PHRASE};

/// Splits a model response into atomic factual claims
pub struct ClaimExtractor {
    citation: Regex,
    min_words: usize,
}

impl ClaimExtractor {
    pub fn new() -> Self {
        Self {
            // [1], [1, 3], [Source: file.txt, Page 2]
            citation: Regex::new(r"\[(?:Source:[^\]]*|\d+(?:\s*,\s*\d+)*)\]").expect("static regex"),
            min_words: 3,
        }
    }

    /// Extract claims in document order
    pub fn extract(&self, response: &str) -> Vec<String> {
        let stripped = self.citation.replace_all(response, "");

        stripped
            .unicode_sentences()
            .map(|s| s.trim())
            .filter(|s| self.is_claim(s))
            .map(|s| s.to_string())
            .collect()
    }

    /// A sentence counts as a factual claim unless it is a question, a
    /// refusal, or the verbatim-value line (verified via its source rule).
    fn is_claim(&self, sentence: &str) -> bool {
        if sentence.is_empty() || sentence.ends_with('?') {
            return false;
        }
        if sentence.contains(REFUSAL_PHRASE) {
            return false;
        }
        if sentence.starts_with(EXACT_LINE_PREFIX) {
            return false;
        }
        sentence.split_whitespace().count() >= self.min_words
    }
}

impl Default for ClaimExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_sentences_and_strips_citations() {
        let extractor = ClaimExtractor::new();
        let claims = extractor.extract(
            "The MUF is 14 MHz at 0400 UTC [1]. The antenna gain is 6 dBi [Source: specs.pdf, Page 3].",
        );

        assert_eq!(claims.len(), 2);
        assert!(claims[0].contains("14 MHz"));
        assert!(!claims[0].contains('['));
        assert!(!claims[1].contains("Source:"));
    }

    #[test]
    fn questions_and_refusals_are_not_claims() {
        let extractor = ClaimExtractor::new();
        let claims = extractor.extract(&format!(
            "Did you mean Part A or Part B? {} The tolerance on Part A is five percent.",
            REFUSAL_PHRASE
        ));

        assert_eq!(claims.len(), 1);
        assert!(claims[0].contains("tolerance"));
    }

    #[test]
    fn exact_line_is_excluded() {
        let extractor = ClaimExtractor::new();
        let claims = extractor.extract("The limit is 42 watts output power.\nExact: 42 W");
        assert_eq!(claims.len(), 1);
        assert!(claims[0].contains("42 watts"));
    }

    #[test]
    fn short_fragments_are_skipped() {
        let extractor = ClaimExtractor::new();
        let claims = extractor.extract("Yes. The measured noise floor was minus 120 dBm.");
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn empty_response_yields_no_claims() {
        let extractor = ClaimExtractor::new();
        assert!(extractor.extract("").is_empty());
        assert!(extractor.extract("   ").is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let extractor = ClaimExtractor::new();
        let text = "Alpha is one. Bravo is two. Charlie is three.";
        assert_eq!(extractor.extract(text), extractor.extract(text));
    }
}
