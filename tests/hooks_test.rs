//! Hook ordering under each sequence mode

mod common;

use common::{config, run, Journal};
use trellis_config::{HookSequence, PoolKind};
use trellis_core::TaskState;
use trellis_runtime::{StaticLoader, SuiteBuilder};

fn hook(journal: &Journal, entry: &'static str) -> impl Fn(trellis_runtime::TestContext) -> std::future::Ready<Result<(), trellis_runtime::TestFailure>> + Send + Sync + 'static {
    let journal = journal.clone();
    move |_| {
        journal.push(entry);
        std::future::ready(Ok(()))
    }
}

/// Root hooks 1 and 2, nested hook 3, one test in the nested suite
fn nested(journal: &Journal) -> StaticLoader {
    let journal = journal.clone();
    StaticLoader::new().with_fn("hooks.yaml", move |s: &mut SuiteBuilder| {
        s.before_all(hook(&journal, "before 1"));
        s.before_all(hook(&journal, "before 2"));
        s.after_all(hook(&journal, "after 1"));
        s.after_all(hook(&journal, "after 2"));
        let journal = journal.clone();
        s.describe("inner", move |s| {
            s.before_all(hook(&journal, "before 3"));
            s.after_all(hook(&journal, "after 3"));
            s.test("body", hook(&journal, "test"));
        });
    })
}

#[tokio::test]
async fn test_stack_sequence_unwinds_in_reverse() {
    let journal = Journal::new();
    let mut config = config(PoolKind::Sandboxed);
    config.sequence.hooks = HookSequence::Stack;

    let outcome = run(config, nested(&journal), &["hooks.yaml"]).await;

    assert_eq!(
        journal.entries(),
        vec!["before 1", "before 2", "before 3", "test", "after 3", "after 2", "after 1"]
    );
    assert_eq!(outcome.result("inner > body").unwrap().state, TaskState::Passed);
}

#[tokio::test]
async fn test_list_sequence_keeps_registration_order() {
    let journal = Journal::new();
    let mut config = config(PoolKind::Sandboxed);
    config.sequence.hooks = HookSequence::List;

    run(config, nested(&journal), &["hooks.yaml"]).await;

    assert_eq!(
        journal.entries(),
        vec!["before 1", "before 2", "before 3", "test", "after 3", "after 1", "after 2"]
    );
}

#[tokio::test]
async fn test_parallel_sequence_runs_levels_in_order() {
    let journal = Journal::new();
    let outcome = run(config(PoolKind::Sandboxed), nested(&journal), &["hooks.yaml"]).await;

    let entries = journal.entries();
    assert_eq!(entries.len(), 7);
    let position = |entry: &str| entries.iter().position(|e| e == entry).unwrap();
    // Same-level hooks may interleave, levels may not
    assert!(position("before 1").max(position("before 2")) < position("before 3"));
    assert!(position("before 3") < position("test"));
    assert!(position("after 3") < position("after 1").min(position("after 2")));
    assert!(outcome.summary.success());
}

#[tokio::test]
async fn test_failing_before_all_fails_the_suite_tests() {
    let loader = StaticLoader::new().with_fn("setup.yaml", |s| {
        s.describe("broken setup", |s| {
            s.before_all(|_| async { Err(trellis_runtime::TestFailure::new("database down")) });
            s.test("needs database", |_| async { Ok(()) });
        });
        s.test("independent", |_| async { Ok(()) });
    });

    let outcome = run(config(PoolKind::Sandboxed), loader, &["setup.yaml"]).await;

    let result = outcome.result("broken setup > needs database").unwrap();
    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(outcome.result("independent").unwrap().state, TaskState::Passed);
}
