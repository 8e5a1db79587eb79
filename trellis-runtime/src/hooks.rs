//! Hook sequencing
//!
//! A [`HookSchedule`] is the ordered list of steps needed to run the hooks of
//! one kind around a suite or a test. Every step is a set of hooks that start
//! together; the next step starts only when the whole previous step is done.
//!
//! * `parallel`: one step per nesting level holding all hooks of that level.
//! * `stack`: one hook per step. Before hooks run outer to inner in
//!   registration order; after hooks unwind inner to outer and in reverse
//!   registration order within a level.
//! * `list`: one hook per step, registration order within a level, after
//!   hooks still go inner to outer.

use trellis_config::HookSequence;
use trellis_core::{HookKind, NodeId, TaskTree};

/// One registered hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookRef {
    pub node: NodeId,
    pub kind: HookKind,
    /// Registration index among hooks of `kind` on `node`
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookSchedule {
    steps: Vec<Vec<HookRef>>,
}

impl HookSchedule {
    /// `beforeAll`/`afterAll` hooks of a single suite
    pub fn for_suite(tree: &TaskTree, suite: NodeId, kind: HookKind, sequence: HookSequence) -> Self {
        Self::build(tree, &[suite], kind, sequence)
    }

    /// `beforeEach`/`afterEach` hooks applying to `test`, taken from all its ancestors
    pub fn for_test(tree: &TaskTree, test: NodeId, kind: HookKind, sequence: HookSequence) -> Self {
        let mut levels = tree.ancestors(test);
        if kind.is_before() {
            levels.reverse();
        }
        Self::build(tree, &levels, kind, sequence)
    }

    fn build(tree: &TaskTree, levels: &[NodeId], kind: HookKind, sequence: HookSequence) -> Self {
        let mut steps = Vec::new();
        for &node in levels {
            let count = tree.get(node).map(|n| n.hook_count(kind)).unwrap_or(0);
            if count == 0 {
                continue;
            }
            let mut hooks: Vec<HookRef> = (0..count)
                .map(|index| HookRef { node, kind, index })
                .collect();

            match sequence {
                HookSequence::Parallel => steps.push(hooks),
                HookSequence::Stack => {
                    if !kind.is_before() {
                        hooks.reverse();
                    }
                    steps.extend(hooks.into_iter().map(|h| vec![h]));
                }
                HookSequence::List => steps.extend(hooks.into_iter().map(|h| vec![h])),
            }
        }
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Vec<HookRef>] {
        &self.steps
    }

    /// All hooks in the order they start
    pub fn flatten(&self) -> Vec<HookRef> {
        self.steps.iter().flatten().copied().collect()
    }
}

impl IntoIterator for HookSchedule {
    type Item = Vec<HookRef>;
    type IntoIter = std::vec::IntoIter<Vec<HookRef>>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}
