//! End-to-end aggregation tests through the `Database` facade.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;

use oxiagg::accumulator::{AccumulatorOp, AccumulatorState};
use oxiagg::{AggregateConfig, AggregateOptions, Database, ExecContext, NativeScriptHost, Value};

// ---------------------------------------------------------------------------
// Test infrastructure
// ---------------------------------------------------------------------------

fn db_with(docs: &[JsonValue]) -> Database {
    let db = Database::new("test");
    db.insert_many("c", docs).unwrap();
    db
}

fn agg(db: &Database, pipeline: JsonValue) -> Vec<JsonValue> {
    db.aggregate("c", &pipeline, &AggregateOptions::default())
        .unwrap()
}

fn opts(v: JsonValue) -> AggregateOptions {
    AggregateOptions::from_value(&Value::from_json(&v)).unwrap()
}

/// A database whose blocking stages spill after a few KiB.
fn spilling_db(dir: &TempDir, max_memory_bytes: usize) -> Database {
    let config = AggregateConfig {
        max_memory_bytes,
        allow_disk_use: true,
        spill_dir: Some(dir.path().to_path_buf()),
        ..AggregateConfig::default()
    };
    Database::with_config("test", config)
}

fn sort_by_id(mut docs: Vec<JsonValue>) -> Vec<JsonValue> {
    docs.sort_by_key(|d| d["_id"].to_string());
    docs
}

// ---------------------------------------------------------------------------
// Accumulators and grouping
// ---------------------------------------------------------------------------

#[test]
fn avg_ignores_missing_and_non_numeric() {
    let db = db_with(&[json!({"a": 1, "b": 2}), json!({"a": 1, "c": "string"}), json!({"a": 1})]);
    let out = agg(&db, json!([{"$group": {"_id": "$a", "avg": {"$avg": "$d"}}}]));
    assert_eq!(out, vec![json!({"_id": 1, "avg": null})]);

    let out = agg(&db, json!([{"$group": {"_id": "$a", "avg": {"$avg": "$b"}}}]));
    assert_eq!(out, vec![json!({"_id": 1, "avg": 2.0})]);
}

#[test]
fn finalize_is_idempotent() {
    let ctx = ExecContext::default();
    let env = ctx.accumulator_env();
    for op in [
        AccumulatorOp::Sum,
        AccumulatorOp::Avg,
        AccumulatorOp::Min,
        AccumulatorOp::Max,
        AccumulatorOp::First,
        AccumulatorOp::Last,
        AccumulatorOp::Push,
        AccumulatorOp::AddToSet,
        AccumulatorOp::StdDevPop,
    ] {
        let mut state = AccumulatorState::new(op, 0);
        for v in [Value::Int32(3), Value::Double(1.5), Value::Null, Value::from("x")] {
            state.accumulate(v, &env).unwrap();
        }
        let first = state.finalize(&Value::Null, &env).unwrap();
        let second = state.finalize(&Value::Null, &env).unwrap();
        assert_eq!(first.to_json(), second.to_json(), "{}", op.name());
    }
}

#[test]
fn spilled_group_equals_in_memory_group() {
    let docs: Vec<_> = (0..600)
        .map(|i| json!({"_id": i, "k": i % 41, "v": i % 97, "tag": format!("t{}", i % 7)}))
        .collect();
    let pipeline = json!([
        {"$group": {
            "_id": "$k",
            "sum": {"$sum": "$v"},
            "avg": {"$avg": "$v"},
            "min": {"$min": "$v"},
            "max": {"$max": "$v"},
            "first": {"$first": "$_id"},
            "last": {"$last": "$_id"},
            "tags": {"$addToSet": "$tag"},
            "low": {"$minN": {"input": "$v", "n": 2}}
        }},
        {"$project": {"tags": 0}}
    ]);

    let plain = db_with(&docs);
    let in_memory = sort_by_id(agg(&plain, pipeline.clone()));

    let dir = TempDir::new().unwrap();
    let small = spilling_db(&dir, 4096);
    small.insert_many("c", &docs).unwrap();
    let spilled = sort_by_id(agg(&small, pipeline));

    assert_eq!(in_memory.len(), 41);
    assert_eq!(in_memory, spilled);
    // Spill runs are removed once the group is exhausted.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn external_sort_equals_in_memory_sort() {
    let docs: Vec<_> = (0..500)
        .map(|i| json!({"_id": i, "k": (i * 7919) % 113, "pad": "x".repeat(20)}))
        .collect();
    let pipeline = json!([{"$sort": {"k": -1, "_id": 1}}, {"$project": {"pad": 0}}]);
    let plain = db_with(&docs);
    let dir = TempDir::new().unwrap();
    let small = spilling_db(&dir, 8192);
    small.insert_many("c", &docs).unwrap();
    assert_eq!(agg(&plain, pipeline.clone()), agg(&small, pipeline));
}

#[test]
fn push_and_concat_arrays_never_spill() {
    let docs: Vec<_> = (0..300)
        .map(|i| json!({"k": i % 2, "xs": ["a".repeat(32), "b".repeat(32)]}))
        .collect();
    let dir = TempDir::new().unwrap();
    let db = spilling_db(&dir, 4096);
    db.insert_many("c", &docs).unwrap();
    for acc in [json!({"$push": "$xs"}), json!({"$concatArrays": "$xs"})] {
        for allow in [true, false] {
            let err = db
                .aggregate(
                    "c",
                    &json!([{"$group": {"_id": "$k", "all": acc}}]),
                    &opts(json!({"allowDiskUse": allow})),
                )
                .unwrap_err();
            assert!(err.is_memory_limit(), "unexpected {err}");
        }
    }
}

#[test]
fn disk_use_disallowed_fails_deterministically() {
    let docs: Vec<_> = (0..400).map(|i| json!({"k": i})).collect();
    let dir = TempDir::new().unwrap();
    let db = spilling_db(&dir, 2048);
    db.insert_many("c", &docs).unwrap();
    for pipeline in [json!([{"$group": {"_id": "$k"}}]), json!([{"$sort": {"k": -1}}])] {
        let err = db
            .aggregate("c", &pipeline, &opts(json!({"allowDiskUse": false})))
            .unwrap_err();
        assert_eq!(err.code(), 292);
        assert_eq!(err.to_json()["codeName"], json!("QueryExceededMemoryLimitNoDiskUseAllowed"));
    }
}

#[test]
fn internal_js_reduce_uses_scripting_host() {
    let host = NativeScriptHost::new().with("sum", |args, _scope| {
        let total: i64 = args[1]
            .as_array()
            .map(|vs| vs.iter().filter_map(Value::integral_i64).sum())
            .unwrap_or_default();
        Ok(Value::Int64(total))
    });
    let db = Database::new("test").with_scripting(Arc::new(host));
    db.insert_many("c", &[json!({"k": 1, "v": 2}), json!({"k": 1, "v": 5})])
        .unwrap();
    let out = agg(
        &db,
        json!([{"$group": {"_id": "$k", "total": {"$_internalJsReduce": {"data": "$v", "eval": "sum"}}}}]),
    );
    assert_eq!(out, vec![json!({"_id": 1, "total": 7})]);
}

// ---------------------------------------------------------------------------
// Streaming stages
// ---------------------------------------------------------------------------

#[test]
fn unwind_replaces_field_per_element() {
    let db = db_with(&[
        json!({"_id": 1, "b": [4, 5]}),
        json!({"_id": 2, "b": []}),
        json!({"_id": 3, "b": null}),
        json!({"_id": 4}),
    ]);
    let out = agg(&db, json!([{"$unwind": "$b"}]));
    assert_eq!(out, vec![json!({"_id": 1, "b": 4}), json!({"_id": 1, "b": 5})]);

    let out = agg(&db, json!([{"$unwind": {"path": "$b", "preserveNullAndEmptyArrays": true}}]));
    assert_eq!(out.len(), 5);
}

#[test]
fn replace_root_rebinds_later_paths() {
    let db = db_with(&[json!({"_id": 1, "inner": {"x": 2, "_id": "i"}, "x": 100})]);
    let out = agg(
        &db,
        json!([
            {"$replaceRoot": {"newRoot": "$inner"}},
            {"$addFields": {"y": {"$multiply": ["$x", 10]}}}
        ]),
    );
    assert_eq!(out, vec![json!({"x": 2, "_id": "i", "y": 20})]);
}

#[test]
fn redact_prunes_under_collation() {
    let db = db_with(&[json!({"_id": 1, "tag": "KEEP", "sub": {"tag": "PRUNE"}})]);
    let out = db
        .aggregate(
            "c",
            &json!([{"$redact": {"$cond": [{"$eq": ["$tag", "prune"]}, "$$PRUNE", "$$DESCEND"]}}]),
            &opts(json!({"collation": {"locale": "en", "strength": 2}})),
        )
        .unwrap();
    assert_eq!(out, vec![json!({"_id": 1, "tag": "KEEP"})]);
}

#[test]
fn lookup_and_graph_lookup() {
    let db = db_with(&[json!({"_id": 1, "ref": "a"}), json!({"_id": 2, "ref": ["b", "c"]})]);
    db.insert_many(
        "other",
        &[
            json!({"_id": "x", "key": "a"}),
            json!({"_id": "y", "key": "c"}),
            json!({"_id": "z", "key": "q"}),
        ],
    )
    .unwrap();
    let out = agg(
        &db,
        json!([
            {"$lookup": {"from": "other", "localField": "ref", "foreignField": "key", "as": "joined"}},
            {"$project": {"n": {"$size": "$joined"}}}
        ]),
    );
    assert_eq!(out, vec![json!({"_id": 1, "n": 1}), json!({"_id": 2, "n": 1})]);

    db.insert_many(
        "edges",
        &[
            json!({"_id": "a", "to": ["b"]}),
            json!({"_id": "b", "to": ["c", "a"]}),
            json!({"_id": "c", "to": ["a", "b"]}),
        ],
    )
    .unwrap();
    let out = agg(
        &db,
        json!([
            {"$match": {"_id": 1}},
            {"$graphLookup": {
                "from": "edges", "startWith": "$ref", "connectFromField": "to",
                "connectToField": "_id", "as": "reach"
            }},
            {"$project": {"ids": "$reach._id"}}
        ]),
    );
    let mut ids: Vec<String> = out[0]["ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn facet_bucket_and_sort_by_count() {
    let docs: Vec<_> = (0..10).map(|i| json!({"_id": i, "price": i * 10, "cat": if i % 3 == 0 { "x" } else { "y" }})).collect();
    let db = db_with(&docs);
    let out = agg(
        &db,
        json!([{"$facet": {
            "byCat": [{"$sortByCount": "$cat"}],
            "buckets": [{"$bucket": {
                "groupBy": "$price",
                "boundaries": [0, 30, 60],
                "default": "other",
                "output": {"n": {"$sum": 1}}
            }}]
        }}]),
    );
    assert_eq!(
        out,
        vec![json!({
            "byCat": [{"_id": "y", "count": 6}, {"_id": "x", "count": 4}],
            "buckets": [{"_id": 0, "n": 3}, {"_id": 30, "n": 3}, {"_id": "other", "n": 4}]
        })]
    );
}

#[test]
fn let_variables_are_visible_to_every_stage() {
    let db = db_with(&[json!({"_id": 1, "v": 3}), json!({"_id": 2, "v": 8})]);
    let out = db
        .aggregate(
            "c",
            &json!([
                {"$match": {"$expr": {"$gt": ["$v", "$$threshold"]}}},
                {"$project": {"scaled": {"$multiply": ["$v", "$$factor"]}}}
            ]),
            &opts(json!({"let": {"threshold": 5, "factor": {"$add": [1, 1]}}})),
        )
        .unwrap();
    assert_eq!(out, vec![json!({"_id": 2, "scaled": 16})]);
}

// ---------------------------------------------------------------------------
// Output stages
// ---------------------------------------------------------------------------

#[test]
fn merge_modes_apply_batches() {
    let db = db_with(&[json!({"_id": 1, "v": 1}), json!({"_id": 2, "v": 2})]);
    db.insert_many("dest", &[json!({"_id": 1, "old": true})]).unwrap();
    let none = agg(&db, json!([{"$merge": {"into": "dest", "whenMatched": "merge", "whenNotMatched": "insert"}}]));
    assert!(none.is_empty());
    let dest = db.find("dest", &json!({})).unwrap();
    assert_eq!(dest, vec![json!({"_id": 1, "old": true, "v": 1}), json!({"_id": 2, "v": 2})]);

    let err = db
        .aggregate(
            "c",
            &json!([{"$addFields": {"_id": 9}}, {"$merge": {"into": "dest", "whenNotMatched": "fail"}}]),
            &AggregateOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), 13113);
}

#[test]
fn out_is_atomic_on_failure() {
    let db = db_with(&[json!({"_id": 1}), json!({"_id": 2, "bad": "x"})]);
    db.insert_many("dest", &[json!({"_id": "keep"})]).unwrap();
    let err = db
        .aggregate(
            "c",
            &json!([{"$project": {"v": {"$add": [1, "$bad"]}}}, {"$out": "dest"}]),
            &AggregateOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), 16554);
    assert_eq!(db.find("dest", &json!({})).unwrap(), vec![json!({"_id": "keep"})]);

    agg(&db, json!([{"$match": {"_id": 99}}, {"$out": "dest"}]));
    assert!(db.find("dest", &json!({})).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn interrupt_handle_cancels_a_running_cursor() {
    let docs: Vec<_> = (0..2000).map(|i| json!({"_id": i})).collect();
    let db = db_with(&docs);
    let mut cursor = db
        .aggregate_cursor("c", &json!([{"$sort": {"_id": -1}}]), &AggregateOptions::default())
        .unwrap();
    let handle = cursor.interrupt_handle();
    assert!(cursor.next().unwrap().is_ok());
    handle.interrupt();
    let err = cursor.find_map(Result::err).unwrap();
    assert_eq!(err.code(), 11601);
}

#[test]
fn concurrent_pipelines_share_nothing() {
    let docs: Vec<_> = (0..500).map(|i| json!({"_id": i, "k": i % 10})).collect();
    let db = Arc::new(db_with(&docs));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(1));
                agg(&db, json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}, {"$sort": {"_id": 1}}]))
            })
        })
        .collect();
    for h in handles {
        let out = h.join().unwrap();
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|d| d["n"] == json!(50)));
    }
}

// ---------------------------------------------------------------------------
// Optimizer transparency
// ---------------------------------------------------------------------------

fn rows_to_docs(rows: &[(i32, Option<i32>)]) -> Vec<JsonValue> {
    rows.iter()
        .enumerate()
        .map(|(i, (a, b))| match b {
            Some(b) => json!({"_id": i, "a": a, "b": b}),
            None => json!({"_id": i, "a": a}),
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn match_sort_is_index_independent(
        rows in prop::collection::vec((0i32..5, prop::option::of(-4i32..4)), 0..40),
        k in 0i32..5,
        desc in any::<bool>(),
    ) {
        let docs = rows_to_docs(&rows);
        let dir = if desc { -1 } else { 1 };
        let pipeline = json!([{"$match": {"a": {"$gte": k}}}, {"$sort": {"b": dir}}]);

        let plain = db_with(&docs);
        let indexed = db_with(&docs);
        indexed.create_index("c", "a").unwrap();
        indexed.create_index("c", "b").unwrap();

        let expected = plain
            .aggregate("c", &pipeline, &opts(json!({"bypassOptimizer": true})))
            .unwrap();
        let optimized = plain.aggregate("c", &pipeline, &AggregateOptions::default()).unwrap();
        let with_index = indexed.aggregate("c", &pipeline, &AggregateOptions::default()).unwrap();
        prop_assert_eq!(&expected, &optimized);
        prop_assert_eq!(&expected, &with_index);
    }

    #[test]
    fn rewrites_preserve_results(
        rows in prop::collection::vec((0i32..4, prop::option::of(0i32..6)), 0..30),
        skip in 0u64..4,
        limit in 1u64..6,
    ) {
        let docs = rows_to_docs(&rows);
        let pipeline = json!([
            {"$sort": {"a": 1}},
            {"$addFields": {"c": {"$add": ["$a", 1]}}},
            {"$match": {"b": {"$exists": true}}},
            {"$match": {"a": {"$lt": 3}}},
            {"$skip": skip},
            {"$limit": limit + 2},
            {"$limit": limit},
            {"$unset": "c"},
        ]);
        let db = db_with(&docs);
        let expected = db
            .aggregate("c", &pipeline, &opts(json!({"bypassOptimizer": true})))
            .unwrap();
        let optimized = db.aggregate("c", &pipeline, &AggregateOptions::default()).unwrap();
        prop_assert_eq!(expected, optimized);
    }
}
