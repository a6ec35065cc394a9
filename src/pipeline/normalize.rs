//! Canonical text form used for cache keys, clustering and keyword counting.

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use super::types::Record;

const MAX_PASSES: usize = 4;

static STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "above", "after", "against", "all", "along", "also", "am", "among", "an",
        "and", "any", "are", "around", "as", "at", "be", "been", "before", "being", "below",
        "between", "both", "but", "by", "can", "could", "did", "do", "does", "during", "each",
        "either", "for", "from", "had", "has", "have", "her", "hers", "him", "his", "how", "if",
        "in", "into", "is", "it", "its", "just", "me", "mine", "more", "most", "my", "neither",
        "no", "nor", "not", "of", "off", "on", "onto", "or", "other", "our", "ours", "out",
        "over", "own", "per", "she", "should", "so", "some", "such", "than", "that", "the",
        "their", "theirs", "them", "then", "there", "these", "they", "this", "those", "through",
        "to", "too", "under", "until", "up", "upon", "us", "very", "via", "vs", "was", "we",
        "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with",
        "within", "without", "would", "you", "your", "yours",
    ]
    .into_iter()
    .collect()
});

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)?$").expect("number pattern is valid"));

static DIMENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+(?:\.\d+)?x\d+(?:\.\d+)?(?:x\d+(?:\.\d+)?)?(?:in|cm|mm|ft)?$")
        .expect("dimension pattern is valid")
});

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+(?:\.\d+)?(?:in|inch|inches|cm|mm|ft|oz|fl|ml|l|lb|lbs|kg|g|gb|tb|pcs|pc|pk|ct)$")
        .expect("quantity pattern is valid")
});

static UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:in|inch|inches|cm|mm|ft|oz|fl|ml|l|lb|lbs|kg|g|gb|tb|pcs|pc|pk|ct|count|pack|piece|pieces)$",
    )
    .expect("unit pattern is valid")
});

static APPAREL_OR_PAPER_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:a[0-9]|b[0-9]|xxs|xs|xl|xxl|xxxl|[2-6]xl)$").expect("size pattern is valid")
});

/// Returns true for English function words removed during normalization.
#[must_use]
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

/// Deterministic cleanup producing one canonical string per record.
///
/// Applies Unicode NFKC folding and lowercasing, segments words per UAX#29,
/// drops punctuation, size tokens (`8.5x11`, `12 oz`, `a4`, `xl`), English
/// stopwords and single ASCII characters. The output is stable under a second
/// application.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn normalize(&self, raw_text: &str) -> String {
        let mut current = normalize_once(raw_text);
        for _ in 1..MAX_PASSES {
            let next = normalize_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Normalizes each record's raw text, preserving order.
    #[must_use]
    pub fn normalize_records(&self, records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|record| self.normalize(&record.raw_text))
            .collect()
    }
}

fn normalize_once(raw_text: &str) -> String {
    let folded: String = raw_text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            '×' => 'x',
            '_' => ' ',
            other => other,
        })
        .collect();

    let mut tokens = Vec::new();
    for word in folded.unicode_words() {
        let word: String = word.chars().filter(|c| !is_apostrophe(*c)).collect();
        if NUMBER.is_match(&word) || DIMENSION.is_match(&word) || QUANTITY.is_match(&word) {
            tokens.push(word);
            continue;
        }
        tokens.extend(
            word.split(|c: char| !c.is_alphanumeric())
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
    }

    loop {
        let before = tokens.len();
        tokens = strip_size_tokens(tokens);
        tokens.retain(|token| !is_stopword(token) && !is_single_ascii(token));
        if tokens.len() == before {
            break;
        }
    }

    tokens.join(" ")
}

fn strip_size_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(tokens.len());
    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index].as_str();
        if DIMENSION.is_match(token)
            || QUANTITY.is_match(token)
            || APPAREL_OR_PAPER_SIZE.is_match(token)
        {
            index += 1;
            continue;
        }
        if NUMBER.is_match(token) {
            let next = tokens.get(index + 1).map(String::as_str);
            let after = tokens.get(index + 2).map(String::as_str);
            if next == Some("x") && after.is_some_and(|t| NUMBER.is_match(t)) {
                index += 3;
                continue;
            }
            if next.is_some_and(|t| UNIT.is_match(t)) {
                index += 2;
                continue;
            }
        }
        kept.push(tokens[index].clone());
        index += 1;
    }
    kept
}

fn is_apostrophe(c: char) -> bool {
    matches!(c, '\'' | '\u{2019}' | '\u{2018}' | '\u{02bc}')
}

fn is_single_ascii(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii())
}
