//! Single- and bi-gram TF-IDF keyword extraction for externalization pointer
//! messages.
//!
//! Each line of the input is treated as a document so IDF has something to
//! divide against; a message with a single line degenerates to plain term
//! frequency, which is fine for the short pointer messages this is used for.

use std::collections::{HashMap, HashSet};

use unicode_segmentation::UnicodeSegmentation;

const MAX_KEYWORDS: usize = 8;

/// Extracts up to [`MAX_KEYWORDS`] single- and bi-gram keywords from `text`,
/// ranked by TF-IDF score. Returns an empty list if `text` yields no tokens.
#[must_use]
pub fn extract_keywords(text: &str) -> Vec<String> {
    let documents = tokenize_documents(text);
    if documents.is_empty() {
        return Vec::new();
    }

    let num_docs = documents.len() as f64;
    let mut doc_frequency: HashMap<String, usize> = HashMap::new();
    for doc in &documents {
        let unique_grams: HashSet<&String> = doc.iter().collect();
        for gram in unique_grams {
            *doc_frequency.entry(gram.clone()).or_insert(0) += 1;
        }
    }

    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut first_seen: Vec<String> = Vec::new();
    for doc in &documents {
        let mut term_frequency: HashMap<String, usize> = HashMap::new();
        for gram in doc {
            *term_frequency.entry(gram.clone()).or_insert(0) += 1;
        }
        let doc_len = doc.len() as f64;
        for (gram, count) in term_frequency {
            let tf = count as f64 / doc_len.max(1.0);
            let df = doc_frequency.get(&gram).copied().unwrap_or(1) as f64;
            let idf = (num_docs / df).ln() + 1.0;
            let entry = scores.entry(gram.clone()).or_insert(0.0);
            if *entry == 0.0 && !first_seen.contains(&gram) {
                first_seen.push(gram.clone());
            }
            *entry += tf * idf;
        }
    }

    let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_pos = first_seen.iter().position(|g| g == &a.0).unwrap_or(usize::MAX);
                let b_pos = first_seen.iter().position(|g| g == &b.0).unwrap_or(usize::MAX);
                a_pos.cmp(&b_pos)
            })
    });

    ranked.into_iter().take(MAX_KEYWORDS).map(|(gram, _)| gram).collect()
}

/// Splits `text` into per-line token documents, each document holding both
/// unigrams and bigrams in sequence order.
fn tokenize_documents(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter_map(|line| {
            let unigrams: Vec<String> = line
                .unicode_words()
                .map(str::to_lowercase)
                .filter(|w| !w.trim().is_empty())
                .collect();
            if unigrams.is_empty() {
                return None;
            }
            let mut grams = unigrams.clone();
            for pair in unigrams.windows(2) {
                grams.push(format!("{} {}", pair[0], pair[1]));
            }
            Some(grams)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_keywords_returns_empty_for_blank_input() {
        assert!(extract_keywords("   \n\n  ").is_empty());
    }

    #[test]
    fn extract_keywords_finds_unigrams_and_bigrams() {
        let text = "deploy service to production\ndeploy service rollback";
        let keywords = extract_keywords(text);
        assert!(!keywords.is_empty());
        assert!(keywords.iter().any(|k| k.contains(' ')));
    }

    #[test]
    fn extract_keywords_caps_at_max_keywords() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let keywords = extract_keywords(text);
        assert!(keywords.len() <= MAX_KEYWORDS);
    }
}
