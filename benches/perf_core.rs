use criterion::{black_box, criterion_group, criterion_main, Criterion};
use patchbench::dataset::BenchmarkInstance;
use patchbench::lab::controller::pick_winner;
use patchbench::lab::{Prediction, RunIdentity, TrialRecord, TrialStatus};
use patchbench::patch::files_in_patch;
use patchbench::store::ResultStore;

fn synthetic_patch(file_count: usize) -> String {
    let mut patch = String::new();
    for i in 0..file_count {
        let path = format!("pkg/module_{:03}/file_{:05}.py", i % 40, i);
        patch.push_str(&format!(
            "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1,3 +1,3 @@\n-    return {i}\n+    return {}\n context\n",
            i + 1
        ));
    }
    patch
}

fn synthetic_history(len: usize) -> Vec<TrialRecord> {
    (0..len)
        .map(|i| TrialRecord {
            instance_id: "bench__bench-1".to_string(),
            model_name_or_path: "bench-agent".to_string(),
            model_patch: if i % 3 == 0 { String::new() } else { synthetic_patch(2) },
            model: format!("model-{}", i % 4),
            temperature: 0.0,
            cost: 0.01,
            added_files: Vec::new(),
            gold_files: Vec::new(),
            edited_files: Vec::new(),
            lint_outcome: Some(i == len - 1),
            test_outcome: None,
            attempt: i / 4 + 1,
            status: if i % 5 == 0 {
                TrialStatus::AgentError
            } else {
                TrialStatus::Completed
            },
            error: None,
            partial_patch: None,
            reprompted: false,
            duration_ms: 0,
        })
        .collect()
}

fn bench_files_in_patch(c: &mut Criterion) {
    let patch = synthetic_patch(2_000);
    c.bench_function("files_in_patch_2000_files", |b| {
        b.iter(|| black_box(files_in_patch(black_box(&patch))).len());
    });
}

fn bench_pick_winner(c: &mut Criterion) {
    let history = synthetic_history(64);
    c.bench_function("pick_winner_64_attempts", |b| {
        b.iter(|| black_box(pick_winner(black_box(&history))));
    });
}

fn bench_store_append(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let instance: BenchmarkInstance = serde_json::from_value(serde_json::json!({
        "instance_id": "bench__bench-1",
        "repo": "bench/bench",
        "base_commit": "deadbeef",
        "problem_statement": "synthetic",
    }))
    .expect("synthetic instance");
    let identity = RunIdentity {
        run_id: "bench".to_string(),
        model_name_or_path: "bench-agent".to_string(),
        temperature: 0.0,
    };
    let prediction = Prediction::placeholder(&instance, &identity, "bench");

    c.bench_function("store_append_into_200_entries", |b| {
        b.iter_batched(
            || {
                let store = ResultStore::new(temp.path().join("preds.json"));
                let _ = std::fs::remove_file(store.path());
                for _ in 0..200 {
                    store.append(&prediction).expect("seed append");
                }
                store
            },
            |store| store.append(black_box(&prediction)).expect("append"),
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    perf_core,
    bench_files_in_patch,
    bench_pick_winner,
    bench_store_append
);
criterion_main!(perf_core);
