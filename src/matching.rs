//! Tiered entity resolution between two sets of identifiers.
//!
//! Each distinct source key walks the tiers in order and stops at the first
//! one that accepts it: exact (after case-folding), lexical similarity,
//! then a semantic judge over a narrowed candidate list. Keys no tier
//! accepts map to `None`; resolution never guesses.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    audit::AuditLedger,
    config::MatchingConfig,
    data::Value,
    dataset::{Column, Dataset, Row},
    schema::ColumnType,
    semantic::{Embedder, MatchJudge, top_candidates},
    similarity::{fold_key, weighted_ratio},
};

pub const KEY_RESOLUTION_STEP: &str = "Key Resolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateSource {
    /// Every target was offered to the judge.
    FullList,
    /// The embedder's best `k` targets were offered.
    VectorTop(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MatchMethod {
    Exact,
    Fuzzy(f64),
    Semantic(CandidateSource),
    Unresolved,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMethod::Exact => f.write_str("exact"),
            MatchMethod::Fuzzy(score) => write!(f, "fuzzy {score:.2}"),
            MatchMethod::Semantic(CandidateSource::FullList) => f.write_str("semantic full-list"),
            MatchMethod::Semantic(CandidateSource::VectorTop(k)) => {
                write!(f, "semantic top-{k}")
            }
            MatchMethod::Unresolved => f.write_str("unresolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub target: Option<String>,
    pub method: MatchMethod,
}

/// Total mapping from every distinct source key to a target or `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyMapping {
    entries: BTreeMap<String, Resolution>,
}

impl KeyMapping {
    pub fn get(&self, source: &str) -> Option<&Resolution> {
        self.entries.get(source)
    }

    pub fn target(&self, source: &str) -> Option<&str> {
        self.entries
            .get(source)
            .and_then(|r| r.target.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.values().filter(|r| r.target.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resolution)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// One line per resolution whose target differs from its source.
    pub fn trace_lines(&self) -> Vec<String> {
        self.iter()
            .filter_map(|(source, resolution)| {
                resolution
                    .target
                    .as_deref()
                    .filter(|target| *target != source)
                    .map(|target| format!("[{}] '{source}' -> '{target}'", resolution.method))
            })
            .collect()
    }

    /// The mapping as a `source, target, method` table.
    pub fn to_dataset(&self, name: &str) -> Dataset {
        let rows = self
            .iter()
            .map(|(source, resolution)| {
                vec![
                    Some(Value::String(source.to_string())),
                    resolution.target.clone().map(Value::String),
                    Some(Value::String(resolution.method.to_string())),
                ]
            })
            .collect::<Vec<Row>>();
        let mut table = Dataset::new(
            name,
            vec![
                Column::new("source", ColumnType::String),
                Column::new("target", ColumnType::String),
                Column::new("method", ColumnType::String),
            ],
        );
        for row in rows {
            // Arity matches the three columns above.
            let _ = table.push_row(row);
        }
        table
    }
}

pub struct MatchingCascade<'a> {
    config: MatchingConfig,
    embedder: Option<&'a dyn Embedder>,
    judge: Option<&'a dyn MatchJudge>,
}

impl<'a> MatchingCascade<'a> {
    /// A cascade with only the exact and lexical tiers.
    pub fn new(config: MatchingConfig) -> Self {
        MatchingCascade {
            config,
            embedder: None,
            judge: None,
        }
    }

    pub fn with_embedder(mut self, embedder: &'a dyn Embedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_judge(mut self, judge: &'a dyn MatchJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn resolve<S, T>(&self, source_keys: S, target_keys: T, ledger: &mut AuditLedger) -> KeyMapping
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let sources: BTreeSet<String> = source_keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .collect();
        let targets: Vec<String> = target_keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut exact_index: HashMap<String, &str> = HashMap::new();
        for target in &targets {
            exact_index.entry(fold_key(target)).or_insert(target.as_str());
        }

        let mut narrowing = VectorNarrowing::default();
        let mut mapping = KeyMapping::default();
        for source in sources {
            let resolution = if targets.is_empty() {
                Resolution {
                    target: None,
                    method: MatchMethod::Unresolved,
                }
            } else {
                self.resolve_one(&source, &targets, &exact_index, &mut narrowing)
            };
            debug!("Resolved '{source}' via {}: {:?}", resolution.method, resolution.target);
            mapping.entries.insert(source, resolution);
        }

        let trace = mapping.trace_lines();
        let mut description = format!(
            "Resolved {} of {} source keys against {} target keys",
            mapping.resolved_count(),
            mapping.len(),
            targets.len()
        );
        if !trace.is_empty() {
            description.push('\n');
            description.push_str(&trace.join("\n"));
        }
        ledger.record_operation(
            KEY_RESOLUTION_STEP,
            &description,
            i64::try_from(trace.len()).unwrap_or(i64::MAX),
        );
        mapping
    }

    fn resolve_one(
        &self,
        source: &str,
        targets: &[String],
        exact_index: &HashMap<String, &str>,
        narrowing: &mut VectorNarrowing,
    ) -> Resolution {
        if let Some(target) = exact_index.get(&fold_key(source)) {
            return Resolution {
                target: Some(target.to_string()),
                method: MatchMethod::Exact,
            };
        }

        let mut best: Option<(&str, f64)> = None;
        for target in targets {
            let score = weighted_ratio(source, target);
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((target, score));
            }
        }
        match best {
            Some((target, score)) if score >= self.config.lexical_threshold => {
                return Resolution {
                    target: Some(target.to_string()),
                    method: MatchMethod::Fuzzy(score),
                };
            }
            _ => {}
        }

        let Some(judge) = self.judge else {
            return unresolved();
        };
        let (candidates, origin) = self.candidates(source, targets, narrowing);
        if candidates.is_empty() {
            return unresolved();
        }
        match judge.judge(source, &candidates) {
            Ok(Some(choice)) if candidates.contains(&choice) => Resolution {
                target: Some(choice),
                method: MatchMethod::Semantic(origin),
            },
            Ok(Some(choice)) => {
                debug!("Judge picked '{choice}' for '{source}', which was not offered");
                unresolved()
            }
            Ok(None) => unresolved(),
            Err(err) => {
                warn!("Match judge failed for '{source}': {err:#}");
                unresolved()
            }
        }
    }

    fn candidates(
        &self,
        source: &str,
        targets: &[String],
        narrowing: &mut VectorNarrowing,
    ) -> (Vec<String>, CandidateSource) {
        let origin = CandidateSource::VectorTop(0);
        if targets.len() <= self.config.full_list_limit {
            return (targets.to_vec(), CandidateSource::FullList);
        }
        let Some(embedder) = self.embedder else {
            return (Vec::new(), origin);
        };
        let Some(target_vectors) = narrowing.targets(embedder, targets) else {
            return (Vec::new(), origin);
        };
        let source_vector = match embedder.embed(&[source.to_string()]) {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => return (Vec::new(), origin),
            Err(err) => {
                warn!("Embedding '{source}' failed: {err:#}");
                return (Vec::new(), origin);
            }
        };
        let picked = top_candidates(
            &source_vector,
            target_vectors,
            self.config.top_k,
            self.config.semantic_floor,
        )
        .into_iter()
        .map(|c| c.key)
        .collect::<Vec<_>>();
        let offered = CandidateSource::VectorTop(picked.len());
        (picked, offered)
    }
}

fn unresolved() -> Resolution {
    Resolution {
        target: None,
        method: MatchMethod::Unresolved,
    }
}

/// Target embeddings, computed at most once per `resolve` call.
#[derive(Default)]
struct VectorNarrowing {
    state: Option<Option<Vec<(String, Vec<f32>)>>>,
}

impl VectorNarrowing {
    fn targets(
        &mut self,
        embedder: &dyn Embedder,
        targets: &[String],
    ) -> Option<&[(String, Vec<f32>)]> {
        self.state
            .get_or_insert_with(|| match embedder.embed(targets) {
                Ok(vectors) if vectors.len() == targets.len() => {
                    Some(targets.iter().cloned().zip(vectors).collect())
                }
                Ok(vectors) => {
                    warn!(
                        "Embedder returned {} vector(s) for {} target(s); skipping vector narrowing",
                        vectors.len(),
                        targets.len()
                    );
                    None
                }
                Err(err) => {
                    warn!("Embedding target keys failed: {err:#}");
                    None
                }
            })
            .as_deref()
    }
}

/// Left-joins `right` onto `left` through the resolved key mapping. Left
/// rows whose key is null, unresolved, or absent from `right` keep nulls in
/// the right-hand columns; right columns whose names collide get a
/// `right_` prefix. Returns the joined table and the count of matched left
/// rows.
pub fn merge_resolved(
    name: &str,
    left: &Dataset,
    left_column: usize,
    right: &Dataset,
    right_column: usize,
    mapping: &KeyMapping,
) -> Result<(Dataset, usize)> {
    let mut right_index: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, row) in right.rows().iter().enumerate() {
        if let Some(value) = &row[right_column] {
            right_index.entry(value.as_display()).or_default().push(idx);
        }
    }

    let mut columns = left.columns().to_vec();
    for column in right.columns() {
        let mut candidate = column.name.clone();
        let mut attempt = 1;
        while columns.iter().any(|c| c.name == candidate) {
            candidate = if attempt == 1 {
                format!("right_{}", column.name)
            } else {
                format!("right_{}_{attempt}", column.name)
            };
            attempt += 1;
        }
        columns.push(Column::new(candidate, column.datatype));
    }

    let mut output = Dataset::new(name, columns);
    let mut matched = 0;
    let blank_right = vec![None; right.column_count()];
    for row in left.rows() {
        let partners = row[left_column]
            .as_ref()
            .and_then(|key| mapping.target(&key.as_display()))
            .and_then(|target| right_index.get(target));
        match partners {
            Some(indices) => {
                matched += 1;
                for &idx in indices {
                    let mut joined = row.clone();
                    joined.extend(right.rows()[idx].iter().cloned());
                    output.push_row(joined)?;
                }
            }
            None => {
                let mut joined = row.clone();
                joined.extend(blank_right.iter().cloned());
                output.push_row(joined)?;
            }
        }
    }
    info!(
        "Merged '{}' with '{}' into '{name}': {matched} of {} left row(s) matched",
        left.name(),
        right.name(),
        left.row_count()
    );
    Ok((output, matched))
}

/// Runs the cascade over the distinct non-null keys of both columns, then
/// joins. Records the key resolution and the merge in `ledger`.
pub fn resolve_and_merge(
    cascade: &MatchingCascade<'_>,
    name: &str,
    (left, left_key): (&Dataset, &str),
    (right, right_key): (&Dataset, &str),
    ledger: &mut AuditLedger,
) -> Result<Dataset> {
    let left_column = left.require_column(left_key)?;
    let right_column = right.require_column(right_key)?;
    let mapping = cascade.resolve(
        left.distinct_display(left_column),
        right.distinct_display(right_column),
        ledger,
    );
    let (merged, matched) =
        merge_resolved(name, left, left_column, right, right_column, &mapping)?;
    ledger.record_operation(
        "Merge",
        &format!(
            "Left-joined '{}' with '{}' on resolved keys into '{name}': {matched} of {} row(s) matched",
            left.name(),
            right.name(),
            left.row_count()
        ),
        i64::try_from(matched).unwrap_or(i64::MAX),
    );
    Ok(merged)
}
