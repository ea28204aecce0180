//! Balancing strategies.
//!
//! A strategy picks one candidate index for a task. Strategies are
//! registered by tag so the balancer can be configured by name; the
//! task-aware variant composes a base strategy rather than replacing it.

use rand::{self, Rng};

use error::Error;
use registry::Node;

pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Picks an index into `candidates`, or `None` when empty.
    fn select(&mut self, candidates: &[Node], task: &str) -> Option<usize>;
}

/// Builds a strategy from its configured tag. The task-aware variant
/// takes its base after a colon, e.g. `task_aware:least_conn`.
pub fn by_name(name: &str) -> Result<Box<Strategy>, Error> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::new())),
        "random" => Ok(Box::new(Random)),
        "weighted" => Ok(Box::new(Weighted)),
        "least_conn" => Ok(Box::new(LeastConn)),
        "task_aware" => Ok(Box::new(TaskAware::new(Box::new(RoundRobin::new())))),
        other => {
            if other.starts_with("task_aware:") {
                let base = &other["task_aware:".len()..];
                return Ok(Box::new(TaskAware::new(by_name(base)?)));
            }
            Err(Error::Internal(format!("unknown balancing strategy `{}`", other)))
        }
    }
}

/// Rotates through the candidates in order.
pub struct RoundRobin {
    next: u64,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin { next: 0 }
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&mut self, candidates: &[Node], _task: &str) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idx = (self.next % candidates.len() as u64) as usize;
        self.next = self.next.wrapping_add(1);
        Some(idx)
    }
}

/// Uniform choice.
pub struct Random;

impl Strategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&mut self, candidates: &[Node], _task: &str) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        Some(rng.gen_range(0, candidates.len()))
    }
}

/// Samples proportionally to node weight; degrades to uniform when the
/// total weight is not positive.
pub struct Weighted;

impl Strategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&mut self, candidates: &[Node], _task: &str) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let total: f64 = candidates.iter().map(|n| f64::max(n.weight as f64, 0.0)).sum();
        let mut rng = rand::thread_rng();
        if total <= 0.0 {
            return Some(rng.gen_range(0, candidates.len()));
        }
        let mut x = rng.gen_range(0.0, total);
        for (idx, node) in candidates.iter().enumerate() {
            x -= f64::max(node.weight as f64, 0.0);
            if x < 0.0 {
                return Some(idx);
            }
        }
        Some(candidates.len() - 1)
    }
}

/// Fewest live connections wins; ties go to the first occurrence.
pub struct LeastConn;

impl Strategy for LeastConn {
    fn name(&self) -> &'static str {
        "least_conn"
    }

    fn select(&mut self, candidates: &[Node], _task: &str) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, node) in candidates.iter().enumerate() {
            let conns = node.connections();
            match best {
                Some((_, least)) if conns >= least => {}
                _ => best = Some((idx, conns)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

/// Ranks candidates by task fit, then delegates to a base strategy over
/// the re-ordered list.
pub struct TaskAware {
    base: Box<Strategy>,
}

impl TaskAware {
    pub fn new(base: Box<Strategy>) -> TaskAware {
        TaskAware { base: base }
    }
}

impl Strategy for TaskAware {
    fn name(&self) -> &'static str {
        "task_aware"
    }

    fn select(&mut self, candidates: &[Node], task: &str) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut ranked: Vec<(usize, f64)> = candidates.iter()
            .enumerate()
            .map(|(idx, node)| (idx, task_fit(node, task)))
            .collect();
        // Stable by score, so equally-fit nodes keep their original order.
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(::std::cmp::Ordering::Equal));

        let reordered: Vec<Node> =
            ranked.iter().map(|&(idx, _)| candidates[idx].clone()).collect();
        self.base
            .select(&reordered, task)
            .map(|picked| ranked[picked].0)
    }
}

/// How well a node fits a task.
///
/// The constants mirror the worker runtimes in the field: accelerator
/// runtimes outrank CPU fallbacks, quantised precisions add a little, and
/// load plus observed error rate pull the score down.
pub fn task_fit(node: &Node, task: &str) -> f64 {
    if !node.supports(task) {
        return -1.0;
    }

    let mut score = 10.0;
    for cap in &node.capabilities {
        if !cap.supports(task) {
            continue;
        }
        score += 20.0;
        score += match cap.runtime.as_str() {
            "cuda" | "tensorrt" => 10.0,
            "coreml" | "ane" => 8.0,
            _ => 2.0,
        };
        if cap.precisions.iter().any(|p| p == "int8") {
            score += 2.0;
        }
        if cap.precisions.iter().any(|p| p == "fp16") {
            score += 1.5;
        }
        score += 0.1 * cap.max_concurrency as f64;
    }

    if let Some(load) = node.load {
        score -= 5.0 * load.cpu;
        score -= 5.0 * load.memory;
    }
    if node.stats.total_requests > 0 {
        score -= 20.0 * node.stats.error_rate();
    }
    score
}
