mod common;

use anyhow::Result;
use tabheal::{
    audit::AuditLedger,
    config::MatchingConfig,
    matching::{CandidateSource, KEY_RESOLUTION_STEP, MatchMethod, MatchingCascade, resolve_and_merge},
    semantic::{AliasJudge, CharNgramEmbedder, MatchJudge},
};

use common::{int, ledger, text};

/// Judge that always proposes a fixed candidate when it is offered.
struct Stubborn(&'static str);

impl MatchJudge for Stubborn {
    fn judge(&self, _source: &str, candidates: &[String]) -> Result<Option<String>> {
        Ok(candidates.iter().find(|c| c.as_str() == self.0).cloned())
    }
}

#[test]
fn mixed_script_names_resolve_through_fuzzy_and_semantic_tiers() {
    let judge = AliasJudge::new().with_alias("腾讯科技有限公司", "Tencent");
    let cascade = MatchingCascade::new(MatchingConfig::default()).with_judge(&judge);
    let mut ledger = AuditLedger::default();
    let mapping = cascade.resolve(
        ["Tencent", "腾讯"],
        ["腾讯科技有限公司", "阿里巴巴集团控股"],
        &mut ledger,
    );

    let fuzzy = mapping.get("腾讯").unwrap();
    assert_eq!(fuzzy.target.as_deref(), Some("腾讯科技有限公司"));
    assert!(matches!(fuzzy.method, MatchMethod::Fuzzy(score) if score >= 90.0));

    let semantic = mapping.get("Tencent").unwrap();
    assert_eq!(semantic.target.as_deref(), Some("腾讯科技有限公司"));
    assert_eq!(semantic.method, MatchMethod::Semantic(CandidateSource::FullList));

    let entry = &ledger.entries()[0];
    assert_eq!(entry.step, KEY_RESOLUTION_STEP);
    assert_eq!(entry.affected_rows, 2);
    assert!(entry.description.contains("Resolved 2 of 2"));
}

#[test]
fn normalized_equal_keys_never_reach_later_tiers() {
    let judge = Stubborn("Acme Holdings");
    let with_judge = MatchingCascade::new(MatchingConfig::default()).with_judge(&judge);
    let plain = MatchingCascade::new(MatchingConfig::default());
    let sources = ["  acme CORP", "Globex"];
    let targets = ["Acme Corp", "Acme Holdings", "GLOBEX"];

    let a = with_judge.resolve(sources, targets, &mut AuditLedger::default());
    let b = plain.resolve(sources, targets, &mut AuditLedger::default());
    assert_eq!(a, b);
    assert_eq!(a.get("  acme CORP").unwrap().method, MatchMethod::Exact);
    assert_eq!(a.target("Globex"), Some("GLOBEX"));
}

#[test]
fn lexical_acceptance_beats_a_disagreeing_judge() {
    let judge = Stubborn("Initech Ltd");
    let cascade = MatchingCascade::new(MatchingConfig::default()).with_judge(&judge);
    let mapping = cascade.resolve(
        ["Initrode Incorporated"],
        ["Initrode Incorporatd", "Initech Ltd"],
        &mut AuditLedger::default(),
    );
    let resolution = mapping.get("Initrode Incorporated").unwrap();
    assert_eq!(resolution.target.as_deref(), Some("Initrode Incorporatd"));
    assert!(matches!(resolution.method, MatchMethod::Fuzzy(_)));
}

#[test]
fn large_target_lists_are_narrowed_by_vectors() {
    let config = MatchingConfig {
        full_list_limit: 3,
        top_k: 2,
        ..MatchingConfig::default()
    };
    let embedder = CharNgramEmbedder::default();
    let judge = AliasJudge::new().with_alias("Northwind Traders", "NWind Trading");
    let cascade = MatchingCascade::new(config)
        .with_embedder(&embedder)
        .with_judge(&judge);
    let targets = [
        "Northwind Traders",
        "Contoso Pharmaceuticals",
        "Fabrikam Fiber",
        "Tailspin Toys",
        "Wide World Importers",
    ];
    let mapping = cascade.resolve(["NWind Trading"], targets, &mut AuditLedger::default());
    let resolution = mapping.get("NWind Trading").unwrap();
    assert_eq!(
        resolution.method,
        MatchMethod::Semantic(CandidateSource::VectorTop(2))
    );
    assert_eq!(resolution.target.as_deref(), Some("Northwind Traders"));
}

#[test]
fn without_an_embedder_large_lists_stay_unresolved() {
    let config = MatchingConfig {
        full_list_limit: 1,
        ..MatchingConfig::default()
    };
    let judge = Stubborn("Beta");
    let cascade = MatchingCascade::new(config).with_judge(&judge);
    let mapping = cascade.resolve(["zzz"], ["Alpha", "Beta"], &mut AuditLedger::default());
    assert_eq!(mapping.get("zzz").unwrap().method, MatchMethod::Unresolved);
}

#[test]
fn merge_keeps_every_left_row() {
    let left = ledger("orders", &[("腾讯", 10), ("Unknown Co", 5)]);
    let right = tabheal::dataset::Dataset::from_rows(
        "companies",
        vec![
            tabheal::dataset::Column::new("key", tabheal::schema::ColumnType::String),
            tabheal::dataset::Column::new("region", tabheal::schema::ColumnType::String),
        ],
        vec![vec![text("腾讯科技有限公司"), text("south")]],
    )
    .unwrap();
    let cascade = MatchingCascade::new(MatchingConfig::default());
    let mut audit = AuditLedger::default();
    let merged = resolve_and_merge(&cascade, "joined", (&left, "key"), (&right, "key"), &mut audit)
        .unwrap();
    assert_eq!(merged.row_count(), 2);
    assert_eq!(merged.name(), "joined");
    let region = merged.require_column("region").unwrap();
    assert_eq!(merged.cell(0, region), text("south").as_ref());
    assert_eq!(merged.cell(1, region), None);
    assert_eq!(merged.cell(0, 1), int(10).as_ref());
    assert_eq!(audit.len(), 2);
}
