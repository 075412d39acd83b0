use std::path::Path;
use std::sync::Arc;

use sift::analysis::dict::DictSettings;
use sift::core::types::DocId;
use sift::index::reader::SearchIndex;
use sift::index::segment::{
    rename_segment, DocinfoMode, IndexSettings, SegmentPaths, CHECKPOINT_EVERY,
};
use sift::indexer::IndexBuilder;
use sift::schema::attr::AttrType;
use sift::schema::schema::Schema;
use sift::search::{search_locals, MatchMode, SearchQuery};
use sift::source::{AttrSourceValue, VecSource};

type Doc = (DocId, Vec<String>, Vec<AttrSourceValue>);

fn settings(stopwords: Option<&Path>) -> IndexSettings {
    IndexSettings {
        min_word_len: 1,
        dict: DictSettings {
            min_word_len: 1,
            morphology: None,
            stopwords_file: stopwords.map(|p| p.to_string_lossy().into_owned()),
            wordforms_file: None,
        },
        checkpoint_every: CHECKPOINT_EVERY,
    }
}

fn build(
    prefix: &Path,
    schema: Schema,
    docs: Vec<Doc>,
    kill: Vec<DocId>,
    stopwords: Option<&Path>,
) -> Arc<SearchIndex> {
    let paths = SegmentPaths::new(prefix);
    let builder = IndexBuilder::new(paths.clone(), DocinfoMode::Extern, settings(stopwords));
    let source = VecSource::new(schema, docs).with_kill_list(kill);
    builder.build(vec![Box::new(source)], None).unwrap();
    Arc::new(SearchIndex::open(paths, false).unwrap())
}

fn one_field_schema() -> Schema {
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.finalize().unwrap();
    schema
}

fn doc(id: DocId, text: &str) -> Doc {
    (id, vec![text.to_string()], vec![])
}

fn search_docs(indexes: &[(String, Arc<SearchIndex>)], query_text: &str) -> Vec<DocId> {
    let query = SearchQuery {
        query: query_text.to_string(),
        mode: MatchMode::Extended,
        ..Default::default()
    };
    let result = search_locals(indexes, &query);
    assert!(result.error.is_none(), "query '{}' failed: {:?}", query_text, result.error);
    result.matches.iter().map(|m| m.doc_id).collect()
}

#[test]
fn build_and_search_with_stopwords() {
    let dir = tempfile::tempdir().unwrap();
    let stopwords = dir.path().join("stopwords.txt");
    std::fs::write(&stopwords, "the\n").unwrap();

    let index = build(
        &dir.path().join("test1"),
        one_field_schema(),
        vec![
            doc(1, "the quick brown fox"),
            doc(2, "the lazy dog"),
            doc(3, "quick dog"),
        ],
        vec![],
        Some(&stopwords),
    );
    let indexes = [("test1".to_string(), index)];

    // descending weight; equal weights keep docid order
    assert_eq!(search_docs(&indexes, "quick"), [1, 3]);
    assert_eq!(search_docs(&indexes, "quick & dog"), [3]);

    let mut docs = search_docs(&indexes, "quick | lazy");
    docs.sort_unstable();
    assert_eq!(docs, [1, 2, 3]);

    // a query of nothing but stopwords matches nothing
    assert_eq!(search_docs(&indexes, "the"), Vec::<DocId>::new());
}

#[test]
fn phrase_vs_proximity() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        &dir.path().join("test1"),
        one_field_schema(),
        vec![doc(1, "a b c d"), doc(2, "a c b d")],
        vec![],
        None,
    );
    let indexes = [("test1".to_string(), index)];

    assert_eq!(search_docs(&indexes, "\"a b\""), [1]);

    let mut docs = search_docs(&indexes, "\"a b\"~2");
    docs.sort_unstable();
    assert_eq!(docs, [1, 2]);
}

#[test]
fn field_masks_limit_matching() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = Schema::new();
    schema.add_field("title").unwrap();
    schema.add_field("body").unwrap();
    schema.finalize().unwrap();

    let index = build(
        &dir.path().join("test1"),
        schema,
        vec![(1, vec!["hello".to_string(), "world".to_string()], vec![])],
        vec![],
        None,
    );
    let indexes = [("test1".to_string(), index)];

    assert_eq!(search_docs(&indexes, "@title hello"), [1]);
    assert_eq!(search_docs(&indexes, "@body hello"), Vec::<DocId>::new());
    assert_eq!(search_docs(&indexes, "@(title,body) hello"), [1]);
    assert_eq!(search_docs(&indexes, "@body world"), [1]);
}

#[test]
fn trailing_shard_killlist_suppresses_earlier_docs() {
    let dir = tempfile::tempdir().unwrap();
    let a = build(
        &dir.path().join("a"),
        one_field_schema(),
        vec![doc(1, "x"), doc(2, "x"), doc(3, "x")],
        vec![],
        None,
    );
    let b = build(
        &dir.path().join("b"),
        one_field_schema(),
        vec![doc(2, "x"), doc(4, "x")],
        vec![2],
        None,
    );
    let indexes = [("a".to_string(), a), ("b".to_string(), b)];

    // fullscan over both shards: B's killlist kills A's doc 2, B's own
    // copy of doc 2 survives; ties keep shard order
    assert_eq!(search_docs(&indexes, ""), [1, 3, 2, 4]);
}

#[test]
fn attribute_round_trip_all_types() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.add_attr("views", AttrType::Int32, 0).unwrap();
    schema.add_attr("uid", AttrType::Int64, 0).unwrap();
    schema.add_attr("published", AttrType::Bool, 0).unwrap();
    schema.add_attr("posted", AttrType::Timestamp, 0).unwrap();
    schema.add_attr("price", AttrType::Float32, 0).unwrap();
    schema.add_attr("label", AttrType::Ordinal, 0).unwrap();
    schema.add_attr("tags", AttrType::Mva, 0).unwrap();
    schema.finalize().unwrap();

    let docs: Vec<Doc> = vec![
        (
            1,
            vec!["one".to_string()],
            vec![
                AttrSourceValue::Int(42),
                AttrSourceValue::Int(1 << 40),
                AttrSourceValue::Int(1),
                AttrSourceValue::Int(1_245_024_000),
                AttrSourceValue::Float(-2.5),
                AttrSourceValue::Str("banana".to_string()),
                AttrSourceValue::Mva(vec![10, 20, 30]),
            ],
        ),
        (
            2,
            vec!["two".to_string()],
            vec![
                AttrSourceValue::Int(7),
                AttrSourceValue::Int(5),
                AttrSourceValue::Int(0),
                AttrSourceValue::Int(0),
                AttrSourceValue::Float(1.25),
                AttrSourceValue::Str("apple".to_string()),
                AttrSourceValue::Mva(vec![]),
            ],
        ),
    ];

    let index = build(&dir.path().join("test1"), schema, docs, vec![], None);
    let schema = index.schema().clone();

    let row = index.row_of(1).unwrap();
    let get = |name: &str| {
        sift::schema::attr::PackedRow::get(&row, schema.attr(name).unwrap().locator)
    };
    assert_eq!(get("views"), 42);
    assert_eq!(get("uid"), 1 << 40);
    assert_eq!(get("published"), 1);
    assert_eq!(get("posted"), 1_245_024_000);
    assert_eq!(
        f32::from_bits(get("price") as u32),
        -2.5
    );
    // ordinals rank in sort order: apple=1, banana=2
    assert_eq!(get("label"), 2);
    let tags = sift::schema::row::mva_values(index.mva_pool(), get("tags"));
    assert_eq!(tags, &[10, 20, 30]);

    let row = index.row_of(2).unwrap();
    let get = |name: &str| {
        sift::schema::attr::PackedRow::get(&row, schema.attr(name).unwrap().locator)
    };
    assert_eq!(get("label"), 1);
    let tags = sift::schema::row::mva_values(index.mva_pool(), get("tags"));
    assert!(tags.is_empty());
}

#[test]
fn update_then_flush_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("test1");
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.add_attr("views", AttrType::Int32, 0).unwrap();
    schema.finalize().unwrap();

    let index = build(
        &prefix,
        schema,
        vec![(1, vec!["hello".to_string()], vec![AttrSourceValue::Int(0)])],
        vec![],
        None,
    );

    let views = index.schema().attr("views").unwrap().locator;
    assert!(index.update_attrs(1, &[(views, 7)]).unwrap());
    assert_eq!(sift::schema::attr::PackedRow::get(&index.row_of(1).unwrap(), views), 7);

    // searches see the update immediately
    let indexes = [("test1".to_string(), Arc::clone(&index))];
    let result = search_locals(&indexes, &SearchQuery {
        query: "hello".to_string(),
        ..Default::default()
    });
    let m = &result.matches[0];
    assert_eq!(m.get_attr(views), 7);

    // the flusher persists, a fresh reopen still sees the value
    assert!(index.save_attributes().unwrap());
    assert!(!index.save_attributes().unwrap());
    drop(indexes);
    drop(index);

    let reopened = SearchIndex::open(SegmentPaths::new(&prefix), false).unwrap();
    let views = reopened.schema().attr("views").unwrap().locator;
    assert_eq!(
        sift::schema::attr::PackedRow::get(&reopened.row_of(1).unwrap(), views),
        7
    );
}

#[test]
fn rotation_swaps_while_old_reader_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("test1");

    let old_index = build(
        &prefix,
        one_field_schema(),
        vec![doc(1, "old content")],
        vec![],
        None,
    );

    // shadow version appears alongside
    let shadow = SegmentPaths::new_variant(&prefix);
    let builder = IndexBuilder::new(shadow, DocinfoMode::Extern, settings(None));
    let source = VecSource::new(one_field_schema(), vec![doc(2, "new content")]);
    builder.build(vec![Box::new(source)], None).unwrap();

    // the swap: cur -> old, new -> cur
    rename_segment(&SegmentPaths::new(&prefix), &SegmentPaths::old_variant(&prefix)).unwrap();
    rename_segment(&SegmentPaths::new_variant(&prefix), &SegmentPaths::new(&prefix)).unwrap();

    // in-flight reader on the old maps still answers correctly
    let old_indexes = [("test1".to_string(), Arc::clone(&old_index))];
    assert_eq!(search_docs(&old_indexes, "old"), [1]);

    // a fresh open sees the rotated-in version
    let new_index = Arc::new(SearchIndex::open(SegmentPaths::new(&prefix), false).unwrap());
    let new_indexes = [("test1".to_string(), new_index)];
    assert_eq!(search_docs(&new_indexes, "new"), [2]);
    assert_eq!(search_docs(&new_indexes, "old"), Vec::<DocId>::new());
}

#[test]
fn filters_and_sorting_paths() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.add_attr("views", AttrType::Int32, 0).unwrap();
    schema.finalize().unwrap();

    let docs: Vec<Doc> = (1..=5)
        .map(|i| {
            (
                i,
                vec!["word".to_string()],
                vec![AttrSourceValue::Int(i * 10)],
            )
        })
        .collect();
    let index = build(&dir.path().join("test1"), schema, docs, vec![], None);
    let indexes = [("test1".to_string(), index)];

    // range filter
    let query = SearchQuery {
        query: "word".to_string(),
        filters: vec![sift::search::filter::FilterSpec {
            attr: "views".to_string(),
            op: sift::search::filter::FilterOp::Range { min: 20, max: 40 },
            exclude: false,
        }],
        ..Default::default()
    };
    let result = search_locals(&indexes, &query);
    let docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    assert_eq!(docs, [2, 3, 4]);
    assert_eq!(result.total_found, 3);

    // extended sort by attribute, descending
    let query = SearchQuery {
        query: "word".to_string(),
        sort_mode: sift::search::SortMode::Extended,
        sort_by: "views desc".to_string(),
        ..Default::default()
    };
    let result = search_locals(&indexes, &query);
    let docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    assert_eq!(docs, [5, 4, 3, 2, 1]);

    // expression sort
    let query = SearchQuery {
        query: "word".to_string(),
        sort_mode: sift::search::SortMode::Expr,
        sort_by: "0 - views".to_string(),
        ..Default::default()
    };
    let result = search_locals(&indexes, &query);
    let docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    assert_eq!(docs, [1, 2, 3, 4, 5]);
}

#[test]
fn group_by_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.add_attr("category", AttrType::Int32, 0).unwrap();
    schema.finalize().unwrap();

    let docs: Vec<Doc> = vec![
        (1, vec!["w".to_string()], vec![AttrSourceValue::Int(7)]),
        (2, vec!["w".to_string()], vec![AttrSourceValue::Int(7)]),
        (3, vec!["w".to_string()], vec![AttrSourceValue::Int(9)]),
    ];
    let index = build(&dir.path().join("test1"), schema, docs, vec![], None);
    let indexes = [("test1".to_string(), index)];

    let query = SearchQuery {
        query: "w".to_string(),
        group: Some(sift::sort::groupby::GroupSpec {
            func: sift::sort::groupby::GroupFunc::Attr,
            attr: "category".to_string(),
            group_sort: "@count desc".to_string(),
            distinct: None,
        }),
        ..Default::default()
    };
    let result = search_locals(&indexes, &query);
    assert_eq!(result.matches.len(), 2);
    let count = result.schema.attr("@count").unwrap().locator;
    let groupby = result.schema.attr("@groupby").unwrap().locator;
    assert_eq!(result.matches[0].get_attr(groupby), 7);
    assert_eq!(result.matches[0].get_attr(count), 2);
    assert_eq!(result.matches[1].get_attr(groupby), 9);
    assert_eq!(result.matches[1].get_attr(count), 1);
}

#[test]
fn quorum_and_before_operators() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        &dir.path().join("test1"),
        one_field_schema(),
        vec![
            doc(1, "alpha beta gamma"),
            doc(2, "alpha delta"),
            doc(3, "gamma alpha"),
        ],
        vec![],
        None,
    );
    let indexes = [("test1".to_string(), index)];

    // at least 2 of the 3 keywords
    let mut docs = search_docs(&indexes, "\"alpha beta gamma\"/2");
    docs.sort_unstable();
    assert_eq!(docs, [1, 3]);

    // order matters for BEFORE
    assert_eq!(search_docs(&indexes, "alpha << gamma"), [1]);
    assert_eq!(search_docs(&indexes, "gamma << alpha"), [3]);
}

#[test]
fn multi_query_batches_share_one_index() {
    let dir = tempfile::tempdir().unwrap();
    let index = build(
        &dir.path().join("test1"),
        one_field_schema(),
        vec![doc(1, "alpha"), doc(2, "beta")],
        vec![],
        None,
    );

    let queries = vec![
        SearchQuery { query: "alpha".to_string(), ..Default::default() },
        SearchQuery { query: "beta".to_string(), ..Default::default() },
        SearchQuery { query: "gamma".to_string(), ..Default::default() },
    ];
    let results = Arc::clone(&index).multi_query(&queries);
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].matches[0].doc_id, 1);
    assert_eq!(results[1].matches[0].doc_id, 2);
    assert!(results[2].matches.is_empty());
}

#[test]
fn select_list_expressions_compute_virtual_attrs() {
    let dir = tempfile::tempdir().unwrap();
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.add_attr("views", AttrType::Int32, 0).unwrap();
    schema.finalize().unwrap();

    let index = build(
        &dir.path().join("test1"),
        schema,
        vec![(1, vec!["w".to_string()], vec![AttrSourceValue::Int(21)])],
        vec![],
        None,
    );
    let indexes = [("test1".to_string(), index)];

    let query = SearchQuery {
        query: "w".to_string(),
        select: "*, views * 2 AS doubled".to_string(),
        ..Default::default()
    };
    let result = search_locals(&indexes, &query);
    assert!(result.error.is_none());
    let doubled = result.schema.attr("doubled").unwrap();
    assert_eq!(result.matches[0].get_attr(doubled.locator), 42);
}
