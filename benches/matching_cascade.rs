use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tabheal::audit::AuditLedger;
use tabheal::config::MatchingConfig;
use tabheal::matching::MatchingCascade;
use tabheal::semantic::{AliasJudge, CharNgramEmbedder};

const PREFIXES: [&str; 6] = ["Northern", "Pacific", "Summit", "Blue River", "Golden", "Harbor"];
const SUFFIXES: [&str; 5] = ["Holdings", "Trading Co", "Logistics Ltd", "Foods", "Partners"];

fn generate_targets(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            format!(
                "{} {} {}",
                PREFIXES[i % PREFIXES.len()],
                SUFFIXES[(i / PREFIXES.len()) % SUFFIXES.len()],
                i
            )
        })
        .collect()
}

/// A mix of exact, misspelled and unrelated keys against `targets`.
fn generate_sources(targets: &[String]) -> Vec<String> {
    targets
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 4 == 0)
        .map(|(i, target)| match i % 3 {
            0 => target.to_uppercase(),
            1 => target.replacen('o', "0", 1),
            _ => format!("Unlisted Vendor {i}"),
        })
        .collect()
}

fn bench_matching_cascade(c: &mut Criterion) {
    let targets = generate_targets(400);
    let sources = generate_sources(&targets);
    let embedder = CharNgramEmbedder::default();
    let judge = AliasJudge::new().with_alias(&targets[7], "Unlisted Vendor 7");

    let mut group = c.benchmark_group("matching_cascade");
    group.bench_function("lexical_only", |b| {
        let cascade = MatchingCascade::new(MatchingConfig::default());
        b.iter_batched(
            AuditLedger::default,
            |mut ledger| black_box(cascade.resolve(&sources, &targets, &mut ledger)),
            BatchSize::SmallInput,
        );
    });
    group.bench_function("with_vector_narrowing", |b| {
        let cascade = MatchingCascade::new(MatchingConfig::default())
            .with_embedder(&embedder)
            .with_judge(&judge);
        b.iter_batched(
            AuditLedger::default,
            |mut ledger| black_box(cascade.resolve(&sources, &targets, &mut ledger)),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_matching_cascade);
criterion_main!(benches);
