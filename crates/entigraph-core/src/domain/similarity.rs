//! Name similarity scoring
//!
//! A pure, symmetric 0-1 score between two name strings. It combines a
//! character-level edit ratio, token-set overlap and an abbreviation bonus
//! ("Jef A" vs "Jef Adriaenssens", "J. Smith" vs "John Smith"). Nothing here
//! touches the graph, so every resolver decision can be replayed in isolation.

/// Bonus added to the edit ratio when one name abbreviates the other
pub const DEFAULT_ABBREVIATION_BONUS: f64 = 0.3;

/// Case-fold a name: lowercase, trimmed, internal whitespace collapsed
pub fn fold_name(name: &str) -> String {
    name.split_whitespace()
        .map(|token| token.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Score two names with the default abbreviation bonus
pub fn score(a: &str, b: &str) -> f64 {
    SimilarityScorer::default().score(a, b)
}

/// Configurable scorer; the only knob is the abbreviation bonus
#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    abbreviation_bonus: f64,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self {
            abbreviation_bonus: DEFAULT_ABBREVIATION_BONUS,
        }
    }
}

impl SimilarityScorer {
    pub fn new(abbreviation_bonus: f64) -> Self {
        Self { abbreviation_bonus }
    }

    /// Similarity of two names in [0, 1]
    pub fn score(&self, a: &str, b: &str) -> f64 {
        let a = fold_name(a);
        let b = fold_name(b);

        if a == b {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let ratio = strsim::normalized_levenshtein(&a, &b);
        let overlap = token_overlap(&a, &b);

        let mut best = ratio.max(overlap);
        if is_abbreviation(&a, &b) {
            best = best.max(ratio + self.abbreviation_bonus);
        }
        best.clamp(0.0, 1.0)
    }

    /// Best score of `name` against any of `variants`
    pub fn best_score<'a, I>(&self, name: &str, variants: I) -> f64
    where
        I: IntoIterator<Item = &'a str>,
    {
        variants
            .into_iter()
            .map(|variant| self.score(name, variant))
            .fold(0.0, f64::max)
    }
}

/// |A ∩ B| / max(|A|, |B|) over whitespace tokens of folded names
fn token_overlap(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;

    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let larger = left.len().max(right.len());
    if larger == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / larger as f64
}

/// True when every token of one name is, in order, a prefix (or initial)
/// of the corresponding token of the other
fn is_abbreviation(a: &str, b: &str) -> bool {
    let left: Vec<&str> = a.split_whitespace().map(strip_initial_dot).collect();
    let right: Vec<&str> = b.split_whitespace().map(strip_initial_dot).collect();

    let prefixes = |short: &[&str], long: &[&str]| {
        !short.is_empty()
            && short.len() <= long.len()
            && short
                .iter()
                .zip(long.iter())
                .all(|(s, l)| !s.is_empty() && l.starts_with(s))
    };

    prefixes(&left, &right) || prefixes(&right, &left)
}

fn strip_initial_dot(token: &str) -> &str {
    token.strip_suffix('.').unwrap_or(token)
}
