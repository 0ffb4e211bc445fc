//! Execution graph resolution.
//!
//! Turns a compiled [`Pipeline`] into a directed acyclic graph whose nodes
//! are job indices and whose edges are `needs` relations, plus implicit
//! stage-ordering edges. The graph is read-only once built; a changed
//! definition means a new graph.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use relay_core::ids::JobId;
use relay_core::model::Pipeline;
use relay_core::{Error, Result};
use std::collections::{BTreeSet, HashSet};

/// Directed acyclic graph of job dependencies.
#[derive(Debug)]
pub struct ExecutionGraph {
    graph: DiGraph<JobId, ()>,
    nodes: Vec<NodeIndex>,
    topo: Vec<JobId>,
}

/// Three-color DFS marks.
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl ExecutionGraph {
    /// Build the graph for a pipeline.
    ///
    /// Edges come from each job's `needs` set, plus an implicit ordering
    /// edge from every job of stage *N* to every job of stage *N+1* that
    /// declared no explicit `needs` — so absent explicit dependencies,
    /// stage order is still honored. Jobs with explicit `needs` opt out
    /// of the stage barrier.
    pub fn build(pipeline: &Pipeline) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(pipeline.jobs.len(), pipeline.jobs.len());
        let nodes: Vec<NodeIndex> = pipeline.jobs.iter().map(|j| graph.add_node(j.id)).collect();

        for job in &pipeline.jobs {
            for dep in &job.needs {
                graph.update_edge(nodes[dep.index()], nodes[job.id.index()], ());
            }
        }

        let mut jobs_per_stage = vec![Vec::new(); pipeline.stages.len()];
        for job in &pipeline.jobs {
            jobs_per_stage[job.stage].push(job.id);
        }

        for job in pipeline.jobs.iter().filter(|j| j.needs.is_empty()) {
            // Barrier against the nearest earlier non-empty stage.
            let prev = jobs_per_stage[..job.stage]
                .iter()
                .rev()
                .find(|stage| !stage.is_empty());
            if let Some(prev) = prev {
                for &dep in prev {
                    graph.update_edge(nodes[dep.index()], nodes[job.id.index()], ());
                }
            }
        }

        let dag = Self {
            graph,
            nodes,
            topo: Vec::new(),
        };
        dag.detect_cycle(pipeline)?;

        let topo = dag.deterministic_topo(pipeline);
        Ok(Self { topo, ..dag })
    }

    /// Jobs this job depends on.
    pub fn dependencies(&self, job: JobId) -> Vec<JobId> {
        let mut deps: Vec<JobId> = self
            .graph
            .neighbors_directed(self.nodes[job.index()], Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        deps.sort();
        deps
    }

    /// Jobs depending on this job.
    pub fn dependents(&self, job: JobId) -> Vec<JobId> {
        let mut deps: Vec<JobId> = self
            .graph
            .neighbors_directed(self.nodes[job.index()], Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        deps.sort();
        deps
    }

    pub fn in_degree(&self, job: JobId) -> usize {
        self.graph
            .neighbors_directed(self.nodes[job.index()], Direction::Incoming)
            .count()
    }

    pub fn job_count(&self) -> usize {
        self.nodes.len()
    }

    /// Topological ordering, used as a scheduling hint and as the
    /// `--dry-run` display order. Matches the dispatch order a
    /// single-worker scheduler would use.
    pub fn topological_hint(&self) -> &[JobId] {
        &self.topo
    }

    /// Transitive dependency closure of every job, indexed by job.
    pub fn closures(&self) -> Vec<HashSet<JobId>> {
        let mut closures: Vec<HashSet<JobId>> = vec![HashSet::new(); self.nodes.len()];
        // Dependencies settle before dependents in topological order.
        for &job in &self.topo {
            let mut closure = HashSet::new();
            for dep in self.dependencies(job) {
                closure.insert(dep);
                closure.extend(closures[dep.index()].iter().copied());
            }
            closures[job.index()] = closure;
        }
        closures
    }

    /// The named jobs plus their transitive dependencies.
    pub fn selection_closure(&self, roots: &[JobId]) -> HashSet<JobId> {
        let closures = self.closures();
        let mut selected = HashSet::new();
        for &root in roots {
            selected.insert(root);
            selected.extend(closures[root.index()].iter().copied());
        }
        selected
    }

    /// Three-color depth-first cycle check. A back edge to an in-progress
    /// node reports the full cycle path in declaration names.
    fn detect_cycle(&self, pipeline: &Pipeline) -> Result<()> {
        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::White
                && let Some(cycle) = self.visit(start, &mut marks, &mut stack)
            {
                let path = cycle
                    .into_iter()
                    .map(|idx| pipeline.jobs[idx].name.clone())
                    .collect();
                return Err(Error::Cycle { path });
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        job: usize,
        marks: &mut Vec<Mark>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[job] = Mark::Gray;
        stack.push(job);

        let successors: BTreeSet<usize> = self
            .graph
            .neighbors_directed(self.nodes[job], Direction::Outgoing)
            .map(|n| self.graph[n].index())
            .collect();

        for next in successors {
            match marks[next] {
                Mark::Gray => {
                    // Back edge: the cycle is the stack from `next` on,
                    // closed by repeating `next`.
                    let pos = stack.iter().position(|&j| j == next).unwrap();
                    let mut cycle: Vec<usize> = stack[pos..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }

        stack.pop();
        marks[job] = Mark::Black;
        None
    }

    /// Kahn's algorithm with a `(stage, declaration)` tie-break, so the
    /// hint is reproducible across runs and identical to the scheduler's
    /// dispatch preference.
    fn deterministic_topo(&self, pipeline: &Pipeline) -> Vec<JobId> {
        let mut unmet: Vec<usize> = (0..self.nodes.len())
            .map(|i| self.in_degree(JobId(i)))
            .collect();
        let mut ready: BTreeSet<(usize, JobId)> = unmet
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| (pipeline.jobs[i].stage, JobId(i)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&(stage, job)) = ready.iter().next() {
            ready.remove(&(stage, job));
            order.push(job);
            for dependent in self.dependents(job) {
                unmet[dependent.index()] -= 1;
                if unmet[dependent.index()] == 0 {
                    ready.insert((pipeline.jobs[dependent.index()].stage, dependent));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relay_core::pipeline::{JobDefinition, PipelineDefinition};
    use std::collections::HashMap;

    fn pipeline(stages: &[&str], jobs: Vec<JobDefinition>) -> Pipeline {
        Pipeline::load(PipelineDefinition {
            name: "test".to_string(),
            description: None,
            stages: stages.iter().map(|s| s.to_string()).collect(),
            variables: HashMap::new(),
            stage_variables: HashMap::new(),
            jobs,
            hooks: vec![],
        })
        .unwrap()
    }

    fn job(name: &str, stage: &str, needs: &[&str]) -> JobDefinition {
        let mut def = JobDefinition::new(name, stage, vec!["true".to_string()]);
        def.needs = needs.iter().map(|s| s.to_string()).collect();
        def
    }

    #[test]
    fn explicit_needs_become_edges() {
        let p = pipeline(
            &["build", "test"],
            vec![job("compile", "build", &[]), job("unit", "test", &["compile"])],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        assert_eq!(g.dependencies(JobId(1)), vec![JobId(0)]);
        assert_eq!(g.dependents(JobId(0)), vec![JobId(1)]);
    }

    #[test]
    fn stage_order_is_honored_without_explicit_needs() {
        let p = pipeline(
            &["build", "test"],
            vec![
                job("compile", "build", &[]),
                job("lint", "build", &[]),
                job("unit", "test", &[]),
            ],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        // `unit` is barriered on every build-stage job.
        assert_eq!(g.dependencies(JobId(2)), vec![JobId(0), JobId(1)]);
        // Jobs within one stage stay independent.
        assert_eq!(g.in_degree(JobId(0)), 0);
        assert_eq!(g.in_degree(JobId(1)), 0);
    }

    #[test]
    fn explicit_needs_opt_out_of_the_stage_barrier() {
        let p = pipeline(
            &["build", "test"],
            vec![
                job("compile", "build", &[]),
                job("lint", "build", &[]),
                job("unit", "test", &["compile"]),
            ],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        // `unit` declared needs, so it is not barriered on `lint`.
        assert_eq!(g.dependencies(JobId(2)), vec![JobId(0)]);
    }

    #[test]
    fn empty_stages_are_bridged() {
        let p = pipeline(
            &["build", "ghost", "deploy"],
            vec![job("compile", "build", &[]), job("publish", "deploy", &[])],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        assert_eq!(g.dependencies(JobId(1)), vec![JobId(0)]);
    }

    #[test]
    fn self_cycle_reports_the_job_twice() {
        let p = pipeline(&["build"], vec![job("ouro", "build", &["ouro"])]);
        let err = ExecutionGraph::build(&p).unwrap_err();

        assert!(matches!(
            &err,
            Error::Cycle { path } if *path == vec!["ouro".to_string(), "ouro".to_string()]
        ));
    }

    #[test]
    fn cycle_error_names_every_job_on_the_cycle() {
        let p = pipeline(
            &["build"],
            vec![
                job("a", "build", &["c"]),
                job("b", "build", &["a"]),
                job("c", "build", &["b"]),
            ],
        );
        let err = ExecutionGraph::build(&p).unwrap_err();

        let Error::Cycle { path } = err else {
            panic!("expected cycle error");
        };
        // Closed path: first and last entries match, all three jobs named.
        assert_eq!(path.first(), path.last());
        for name in ["a", "b", "c"] {
            assert!(path.contains(&name.to_string()), "missing {name} in {path:?}");
        }
    }

    #[test]
    fn topological_hint_is_deterministic_and_valid() {
        let p = pipeline(
            &["build", "test", "deploy"],
            vec![
                job("compile", "build", &[]),
                job("lint", "build", &[]),
                job("unit", "test", &["compile"]),
                job("e2e", "test", &["compile"]),
                job("publish", "deploy", &[]),
            ],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        let hint = g.topological_hint();
        assert_eq!(
            hint,
            [JobId(0), JobId(1), JobId(2), JobId(3), JobId(4)],
            "stage then declaration order"
        );

        // Every edge points forward in the hint.
        for job in hint.iter() {
            let pos = |id: &JobId| hint.iter().position(|j| j == id).unwrap();
            for dep in g.dependencies(*job) {
                assert!(pos(&dep) < pos(job));
            }
        }
    }

    #[test]
    fn closures_are_transitive() {
        let p = pipeline(
            &["build", "test", "deploy"],
            vec![
                job("compile", "build", &[]),
                job("unit", "test", &["compile"]),
                job("publish", "deploy", &["unit"]),
            ],
        );
        let g = ExecutionGraph::build(&p).unwrap();
        let closures = g.closures();

        assert!(closures[0].is_empty());
        assert_eq!(closures[1], HashSet::from([JobId(0)]));
        assert_eq!(closures[2], HashSet::from([JobId(0), JobId(1)]));
    }

    #[test]
    fn selection_closure_pulls_in_dependencies() {
        let p = pipeline(
            &["build", "test"],
            vec![
                job("compile", "build", &[]),
                job("lint", "build", &[]),
                job("unit", "test", &["compile"]),
            ],
        );
        let g = ExecutionGraph::build(&p).unwrap();

        let selected = g.selection_closure(&[JobId(2)]);
        assert_eq!(selected, HashSet::from([JobId(0), JobId(2)]));
    }
}
