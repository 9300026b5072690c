//! Semantic capabilities used by the last two matching tiers.
//!
//! Both are plain traits so the host decides what backs them: a real
//! embedding model and a language model in production, the built-in
//! [`CharNgramEmbedder`] and [`AliasJudge`] for offline runs and tests.
//! Instances are built explicitly by the host and injected; nothing here is
//! lazily initialized behind a global.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{similarity::fold_key, yaml_provider};

/// Turns texts into dense vectors, one per input, in input order.
pub trait Embedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Picks the candidate that denotes the same real-world entity as `source`,
/// or answers `None`.
pub trait MatchJudge {
    fn judge(&self, source: &str, candidates: &[String]) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    pub score: f32,
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let (mut dot, mut left_norm, mut right_norm) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Top `k` targets by cosine similarity to `source`, strictly above `floor`,
/// best first. Ties keep target order.
pub fn top_candidates(
    source: &[f32],
    targets: &[(String, Vec<f32>)],
    k: usize,
    floor: f32,
) -> Vec<Candidate> {
    let mut scored = targets
        .iter()
        .map(|(key, embedding)| Candidate {
            key: key.clone(),
            score: cosine_similarity(source, embedding),
        })
        .filter(|c| c.score > floor)
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

/// Hashed bag of character unigrams and bigrams, L2-normalized.
///
/// Cheap and deterministic. It captures shared characters (so CJK names
/// with common characters land close), not meaning.
#[derive(Debug, Clone)]
pub struct CharNgramEmbedder {
    dimensions: usize,
}

impl Default for CharNgramEmbedder {
    fn default() -> Self {
        CharNgramEmbedder { dimensions: 256 }
    }
}

impl CharNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        CharNgramEmbedder {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let chars = fold_key(text)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<Vec<_>>();
        for ch in &chars {
            let mut buf = [0u8; 4];
            vector[self.bucket(ch.encode_utf8(&mut buf).as_bytes())] += 1.0;
        }
        for pair in chars.windows(2) {
            let gram = pair.iter().collect::<String>();
            vector[self.bucket(gram.as_bytes())] += 0.5;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn bucket(&self, bytes: &[u8]) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dimensions as u64) as usize
    }
}

impl Embedder for CharNgramEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Answers from a fixed table of canonical names and their aliases, e.g.
/// abbreviations, transliterations and former corporate names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasJudge {
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
}

impl AliasJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, canonical: &str, alias: &str) -> Self {
        self.aliases
            .entry(canonical.to_string())
            .or_default()
            .push(alias.to_string());
        self
    }

    /// Loads a YAML table of the form `aliases: {canonical: [alias, ...]}`.
    pub fn load(path: &Path) -> Result<Self> {
        yaml_provider::load_from_path(path)
            .with_context(|| format!("Loading alias table from {path:?}"))
    }

    fn names_for<'a>(&'a self, candidate: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let folded = fold_key(candidate);
        std::iter::once(candidate).chain(
            self.aliases
                .iter()
                .filter(move |(canonical, _)| fold_key(canonical) == folded)
                .flat_map(|(_, aliases)| aliases.iter().map(String::as_str)),
        )
    }
}

impl MatchJudge for AliasJudge {
    fn judge(&self, source: &str, candidates: &[String]) -> Result<Option<String>> {
        let wanted = fold_key(source);
        Ok(candidates
            .iter()
            .find(|candidate| self.names_for(candidate).any(|name| fold_key(name) == wanted))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_candidates_respects_floor_and_k() {
        let targets = vec![
            ("a".to_string(), vec![1.0, 0.0]),
            ("b".to_string(), vec![0.7, 0.7]),
            ("c".to_string(), vec![0.0, 1.0]),
        ];
        let picked = top_candidates(&[1.0, 0.0], &targets, 5, 0.1);
        assert_eq!(
            picked.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(top_candidates(&[1.0, 0.0], &targets, 1, 0.1).len(), 1);
    }

    #[test]
    fn ngram_embedder_is_deterministic_and_normalized() {
        let embedder = CharNgramEmbedder::default();
        let texts = vec!["腾讯科技".to_string(), "腾讯科技".to_string(), "".to_string()];
        let vectors = embedder.embed(&texts).unwrap();
        assert_eq!(vectors[0], vectors[1]);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(vectors[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn alias_judge_matches_aliases_of_candidates_only() {
        let judge = AliasJudge::new().with_alias("腾讯科技有限公司", "Tencent");
        let candidates = vec!["腾讯科技有限公司".to_string(), "阿里巴巴集团控股".to_string()];
        assert_eq!(
            judge.judge("tencent", &candidates).unwrap(),
            Some("腾讯科技有限公司".to_string())
        );
        assert_eq!(judge.judge("ByteDance", &candidates).unwrap(), None);
        assert_eq!(
            judge
                .judge("Tencent", &["阿里巴巴集团控股".to_string()])
                .unwrap(),
            None
        );
    }
}
