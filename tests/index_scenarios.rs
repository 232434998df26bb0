//! End-to-end scenarios against the public index API.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sedge::doclist::DocidOrder;
use sedge::{IndexConfig, MemoryStore, TextIndex, TokenizerRegistry};

fn open(config: IndexConfig) -> (Arc<MemoryStore>, TextIndex) {
    let store = Arc::new(MemoryStore::new());
    let index = TextIndex::new(store.clone(), config, &TokenizerRegistry::new()).unwrap();
    (store, index)
}

fn matches(index: &TextIndex, query: &str) -> Vec<i64> {
    let mut cursor = index.query(query, 0).unwrap();
    let mut out = Vec::new();
    while cursor.next().unwrap() {
        out.push(cursor.docid());
    }
    out
}

#[test]
fn test_document_lifecycle() {
    let (_, index) = open(IndexConfig::new(vec!["body"]));

    index.insert(1, 0, &["the quick brown fox jumps"]).unwrap();
    index.insert(2, 0, &["a quick brown dog sleeps"]).unwrap();
    index.insert(3, 0, &["the slow green turtle"]).unwrap();

    assert_eq!(matches(&index, "\"quick brown\""), vec![1, 2]);
    assert_eq!(matches(&index, "quick NOT dog"), vec![1]);
    assert_eq!(index.totals().unwrap()[0], 3);

    index.sync().unwrap();
    assert_eq!(matches(&index, "\"quick brown\""), vec![1, 2]);

    index.delete(2).unwrap();
    index.sync().unwrap();
    assert_eq!(matches(&index, "\"quick brown\""), vec![1]);
    assert_eq!(index.totals().unwrap()[0], 2);
    assert!(index.docsize(2).unwrap().is_none());
    assert_eq!(index.docsize(3).unwrap(), Some(vec![4]));

    index.run_command("optimize").unwrap();
    assert_eq!(matches(&index, "\"quick brown\""), vec![1]);
    assert_eq!(matches(&index, "turtle"), vec![3]);
    index.run_command("integrity-check").unwrap();
}

#[test]
fn test_phrases_stop_at_column_boundaries() {
    let (_, index) = open(IndexConfig::new(vec!["title", "body"]));
    index
        .insert(1, 0, &["ends with brown", "fox starts here"])
        .unwrap();
    index.insert(2, 0, &["x", "brown fox together"]).unwrap();
    index.sync().unwrap();

    // "brown" tail of column 0 and "fox" head of column 1 never join.
    assert_eq!(matches(&index, "\"brown fox\""), vec![2]);

    let mut cursor = index.query("fox", 0).unwrap();
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.docid(), 1);
    assert!(cursor.positions(0).unwrap().is_empty());
    assert_eq!(cursor.positions(1).unwrap(), vec![0]);
}

#[test]
fn test_near_and_boolean_combined() {
    let (_, index) = open(IndexConfig::new(vec!["body"]));
    index
        .insert(1, 0, &["alpha filler beta and also gamma"])
        .unwrap();
    index
        .insert(2, 0, &["alpha one two three four five six beta"])
        .unwrap();
    index.insert(3, 0, &["alpha beta gamma"]).unwrap();
    index.sync().unwrap();

    assert_eq!(matches(&index, "alpha NEAR/2 beta"), vec![1, 3]);
    assert_eq!(matches(&index, "alpha NEAR/2 beta NOT gamma"), Vec::<i64>::new());
    assert_eq!(matches(&index, "alpha NEAR/10 beta OR gamma"), vec![1, 2, 3]);
}

#[test]
fn test_descending_docid_order() {
    let config = IndexConfig::new(vec!["body"]).with_order(DocidOrder::Desc);
    let (_, index) = open(config);

    // Descending indexes buffer docids newest-first.
    index.insert(9, 0, &["shared alpha"]).unwrap();
    index.insert(5, 0, &["shared beta"]).unwrap();
    index.insert(1, 0, &["shared gamma"]).unwrap();
    index.sync().unwrap();

    assert_eq!(matches(&index, "shared"), vec![9, 5, 1]);
    assert_eq!(matches(&index, "shared NOT beta"), vec![9, 1]);
}

#[test]
fn test_prefix_queries_with_and_without_prefix_index() {
    let config = IndexConfig::new(vec!["body"]).with_prefixes(vec![2]);
    let (_, index) = open(config);
    index.insert(1, 0, &["grape growing guide"]).unwrap();
    index.insert(2, 0, &["grain and gravel"]).unwrap();
    index.sync().unwrap();

    // Length 2 hits the dedicated prefix index; length 3 falls back to a
    // range scan of the main index.
    assert_eq!(matches(&index, "gr*"), vec![1, 2]);
    assert_eq!(matches(&index, "gra*"), vec![1, 2]);
    assert_eq!(matches(&index, "grow*"), vec![1]);
    index.run_command("integrity-check").unwrap();
}

#[test]
fn test_random_churn_matches_reference() {
    let vocab = [
        "ash", "birch", "cedar", "dogwood", "elm", "fir", "ginkgo", "hazel", "ivy", "juniper",
        "kapok", "larch", "maple", "nutmeg", "oak", "pine",
    ];
    let mut rng = StdRng::seed_from_u64(0x5ed6e);
    let (_, index) = open(IndexConfig::new(vec!["body"]));

    let mut reference: Vec<(i64, Vec<&str>)> = Vec::new();
    for docid in 1..=120i64 {
        let words: Vec<&str> = (0..6)
            .map(|_| vocab[rng.random_range(0..vocab.len())])
            .collect();
        index.insert(docid, 0, &[words.join(" ").as_str()]).unwrap();
        reference.push((docid, words));

        if docid % 17 == 0 {
            index.sync().unwrap();
        }
        if docid % 40 == 0 {
            index.run_command("merge=16,2").unwrap();
        }
    }

    // Delete a third of the documents.
    let doomed: Vec<i64> = (1..=120).filter(|d| d % 3 == 0).collect();
    for &docid in &doomed {
        index.delete(docid).unwrap();
        reference.retain(|(d, _)| *d != docid);
    }
    index.sync().unwrap();
    index.run_command("merge=100,2").unwrap();

    for term in vocab {
        let expected: Vec<i64> = reference
            .iter()
            .filter(|(_, words)| words.contains(&term))
            .map(|(d, _)| *d)
            .collect();
        assert_eq!(matches(&index, term), expected, "term {term}");
    }

    // Two-term conjunctions against the same reference.
    for pair in [("oak", "pine"), ("ash", "elm"), ("ivy", "ivy")] {
        let expected: Vec<i64> = reference
            .iter()
            .filter(|(_, words)| words.contains(&pair.0) && words.contains(&pair.1))
            .map(|(d, _)| *d)
            .collect();
        let query = format!("{} {}", pair.0, pair.1);
        assert_eq!(matches(&index, &query), expected, "query {query}");
    }

    index.run_command("integrity-check").unwrap();
    assert_eq!(index.totals().unwrap()[0] as usize, reference.len());
}

#[test]
fn test_rebuild_matches_original_results() {
    let (_, index) = open(IndexConfig::new(vec!["body"]).with_prefixes(vec![3]));
    for (docid, text) in [
        (1, "winter storms arrive"),
        (2, "spring rain follows"),
        (3, "summer heat persists"),
    ] {
        index.insert(docid, 0, &[text]).unwrap();
    }
    index.sync().unwrap();

    let before = matches(&index, "s*");
    index.run_command("rebuild").unwrap();
    assert_eq!(matches(&index, "s*"), before);
    index.run_command("integrity-check").unwrap();
}
