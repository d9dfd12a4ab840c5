//! Marks targets clean or dirty against the fingerprint cache.

use std::collections::{HashMap, HashSet};

use petgraph::visit::{DfsPostOrder, Reversed};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::cache::Cache;
use crate::error::FingerprintError;
use crate::fingerprint::Fingerprinter;
use crate::graph::TargetGraph;

/// Walks the graph children first. A target is clean when all of its
/// children are clean and none of its globs changed since the last run.
///
/// Every glob of every reachable target is fingerprinted and written to the
/// cache, even once the target is known to be dirty, so the cache reflects
/// the current file system for the next run. Shared targets are evaluated
/// once. Targets in the same directory naming the same glob share one cache
/// entry, so each entry is written once per pass and every target naming it
/// sees the same answer.
///
/// When fingerprinting fails, entries already written this pass that reported
/// a change are dropped again. Nothing runs after a failed pass, so the next
/// pass has to see those changes too.
pub fn propagate(
    graph: &mut TargetGraph,
    cache: &Cache,
    fingerprinter: &Fingerprinter,
) -> Result<usize, FingerprintError> {
    let mut seen = HashMap::new();
    let result = mark(graph, cache, fingerprinter, &mut seen);

    if result.is_err() {
        let changed: Vec<_> = seen.iter().filter(|&(_, &changed)| changed).collect();
        for (key, _) in &changed {
            cache.forget(key);
        }
        tracing::debug!("forgot {} changed fingerprints after an error", changed.len());
    }

    result
}

fn mark(
    graph: &mut TargetGraph,
    cache: &Cache,
    fingerprinter: &Fingerprinter,
    seen: &mut HashMap<String, bool>,
) -> Result<usize, FingerprintError> {
    let mut dirty = 0;
    let mut visit = DfsPostOrder::new(Reversed(&graph.graph), graph.root);

    while let Some(index) = visit.next(Reversed(&graph.graph)) {
        let node = &graph[index];
        let keys: Vec<_> = node
            .globs
            .iter()
            .map(|glob| (node.dir.join(glob).into_string(), glob.as_str()))
            .collect();

        // Every result is collected so that successful writes are remembered
        // even when a sibling glob fails.
        let results: Vec<_> = keys
            .par_iter()
            .filter(|(key, _)| !seen.contains_key(key))
            .map(|(key, glob)| {
                let changed = fingerprinter
                    .fingerprint(&node.dir, glob)
                    .map(|fingerprint| cache.set(key, fingerprint));
                (key, changed)
            })
            .collect();

        let mut error = None;
        for (key, changed) in results {
            match changed {
                Ok(changed) => {
                    if changed {
                        tracing::debug!("{node}: '{key}' changed");
                    }
                    *seen.entry(key.clone()).or_default() |= changed;
                }
                Err(err) => {
                    error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = error {
            return Err(err);
        }

        let changed = keys.iter().any(|(key, _)| seen[key]);
        let clean = !changed && graph.children(index).all(|child| graph[child].clean);
        graph[index].clean = clean;

        if !clean && !graph[index].is_root() {
            dirty += 1;
        }
    }

    tracing::info!("{dirty} of {} targets need to run", graph.len() - 1);

    Ok(dirty)
}

/// Drops the cached fingerprints behind every target left dirty by a run
/// that stopped early, so the next run does not take them for clean. A target
/// without globs of its own hands this down to its children.
pub fn forget_unfinished(graph: &TargetGraph, cache: &Cache) -> usize {
    let mut seen = HashSet::new();
    let mut stack: Vec<_> = graph
        .graph
        .node_indices()
        .filter(|&index| !graph[index].clean && !graph[index].is_root())
        .collect();
    let mut forgotten = 0;

    while let Some(index) = stack.pop() {
        if !seen.insert(index) {
            continue;
        }

        let node = &graph[index];
        if node.globs.is_empty() {
            stack.extend(graph.children(index));
            continue;
        }

        for glob in &node.globs {
            cache.forget(node.dir.join(glob).as_str());
            forgotten += 1;
        }
    }

    tracing::debug!("forgot {forgotten} fingerprints of unfinished targets");
    forgotten
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        _dir: TempDir,
        root: Utf8PathBuf,
        cache: Cache,
    }

    impl Fixture {
        fn new(kilnfile: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            let cache = Cache::open(root.join("cache.db")).unwrap();
            fs::write(root.join("Kilnfile"), kilnfile).unwrap();
            Self {
                _dir: dir,
                root,
                cache,
            }
        }

        fn write(&self, path: &str, content: &str) {
            let path = self.root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn check(&self, target: &str) -> (TargetGraph, usize) {
            let mut graph =
                TargetGraph::build(&self.root.join("Kilnfile"), &[target.to_string()]).unwrap();
            let dirty = propagate(&mut graph, &self.cache, &Fingerprinter::new(true)).unwrap();
            (graph, dirty)
        }
    }

    fn is_clean(graph: &TargetGraph, name: &str) -> bool {
        graph[graph.find(name).unwrap()].clean
    }

    #[test]
    fn test_second_pass_is_clean() {
        let fx = Fixture::new("all: *.py\n\techo a\n");
        fx.write("a.py", "a");

        let (graph, dirty) = fx.check("all");
        assert_eq!(dirty, 1);
        assert!(!is_clean(&graph, "all"));

        let (graph, dirty) = fx.check("all");
        assert_eq!(dirty, 0);
        assert!(is_clean(&graph, "all"));
        assert!(graph[graph.root()].clean);
    }

    #[test]
    fn test_change_dirties_only_ancestors() {
        let fx = Fixture::new(
            "top: left right\nleft: base l.txt\nright: base r.txt\nbase: b.txt\nother: o.txt\n",
        );
        for file in ["l.txt", "r.txt", "b.txt", "o.txt"] {
            fx.write(file, "0");
        }
        fx.check("top");
        fx.check("other");

        fx.write("l.txt", "1");
        let (graph, dirty) = fx.check("top");
        assert_eq!(dirty, 2);
        assert!(!is_clean(&graph, "top"));
        assert!(!is_clean(&graph, "left"));
        assert!(is_clean(&graph, "right"));
        assert!(is_clean(&graph, "base"));

        let (graph, _) = fx.check("other");
        assert!(is_clean(&graph, "other"));
    }

    #[test]
    fn test_shared_child_is_dirty_for_every_parent() {
        let fx = Fixture::new("top: left right\nleft: base\nright: base\nbase: b.txt\n");
        fx.write("b.txt", "0");
        fx.check("top");

        fx.write("b.txt", "1");
        let (graph, dirty) = fx.check("top");
        assert_eq!(dirty, 4);
        for name in ["top", "left", "right", "base"] {
            assert!(!is_clean(&graph, name), "{name} should be dirty");
        }
    }

    #[test]
    fn test_all_globs_are_recorded_when_dirty() {
        let fx = Fixture::new("t: a.txt b.txt\n");
        fx.write("a.txt", "0");
        fx.write("b.txt", "0");
        fx.check("t");

        // Both changes land in the same run; the next run must see neither.
        fx.write("a.txt", "1");
        fx.write("b.txt", "1");
        let (_, dirty) = fx.check("t");
        assert_eq!(dirty, 1);
        let (_, dirty) = fx.check("t");
        assert_eq!(dirty, 0);
    }

    #[test]
    fn test_missing_files_are_not_errors() {
        let fx = Fixture::new("t: generated/*.o\n");
        let (_, dirty) = fx.check("t");
        assert_eq!(dirty, 1);
        let (_, dirty) = fx.check("t");
        assert_eq!(dirty, 0);

        fx.write("generated/x.o", "x");
        let (_, dirty) = fx.check("t");
        assert_eq!(dirty, 1);
    }

    #[test]
    fn test_forget_unfinished() {
        let fx = Fixture::new("top: mid t.txt\nmid: leaf\nleaf: l.txt\nother: o.txt\n");
        fx.write("t.txt", "0");
        fx.write("l.txt", "0");
        fx.write("o.txt", "0");
        fx.check("other");

        // Pretend only `leaf` finished before the run stopped.
        let (mut graph, _) = fx.check("top");
        let leaf = graph.find("leaf").unwrap();
        graph[leaf].clean = true;
        // `top` has its own glob, `mid` hands down to `leaf`.
        assert_eq!(forget_unfinished(&graph, &fx.cache), 2);

        let (graph, dirty) = fx.check("top");
        assert_eq!(dirty, 3);
        assert!(!is_clean(&graph, "mid"));
        let (graph, _) = fx.check("other");
        assert!(is_clean(&graph, "other"));
    }

    #[test]
    fn test_targets_sharing_a_glob_change_together() {
        let fx = Fixture::new("all: build lint\nbuild: *.c\nlint: *.c\n");
        fx.write("main.c", "0");

        let (graph, dirty) = fx.check("all");
        assert_eq!(dirty, 3);
        assert!(!is_clean(&graph, "build"));
        assert!(!is_clean(&graph, "lint"));

        let (_, dirty) = fx.check("all");
        assert_eq!(dirty, 0);

        fx.write("main.c", "1");
        let (graph, dirty) = fx.check("all");
        assert_eq!(dirty, 3);
        assert!(!is_clean(&graph, "build"));
        assert!(!is_clean(&graph, "lint"));

        let (_, dirty) = fx.check("all");
        assert_eq!(dirty, 0);
    }

    #[test]
    fn test_error_keeps_earlier_changes() {
        let fx = Fixture::new("top: mid\nmid: m.txt\n");
        fx.write("m.txt", "0");
        fx.check("top");

        // `mid` is fingerprinted before `top` fails.
        fx.write("m.txt", "1");
        fx.write("Kilnfile", "top: mid bad/***\nmid: m.txt\n");
        let mut graph =
            TargetGraph::build(&fx.root.join("Kilnfile"), &["top".to_string()]).unwrap();
        let result = propagate(&mut graph, &fx.cache, &Fingerprinter::new(true));
        assert!(result.is_err());

        fx.write("Kilnfile", "top: mid\nmid: m.txt\n");
        let (graph, dirty) = fx.check("top");
        assert_eq!(dirty, 2);
        assert!(!is_clean(&graph, "mid"));
    }

    #[test]
    fn test_glob_error_aborts() {
        let fx = Fixture::new("t: bad/***\n");
        let mut graph =
            TargetGraph::build(&fx.root.join("Kilnfile"), &["t".to_string()]).unwrap();
        let result = propagate(&mut graph, &fx.cache, &Fingerprinter::default());
        assert!(result.is_err());
    }
}
