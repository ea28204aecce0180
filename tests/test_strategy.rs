extern crate lumen_mesh;

use lumen_mesh::balance::{LoadBalancer, strategy};
use lumen_mesh::balance::strategy::Strategy;
use lumen_mesh::config::LoadBalancerConfig;
use lumen_mesh::error::Error;
use lumen_mesh::registry::{Node, NodeStatus};
use lumen_mesh::wire::{Capability, TaskSpec};

fn active_node(instance: &str, port: u16, tasks: &[&str]) -> Node {
    let addr = format!("127.0.0.1:{}", port).parse().unwrap();
    let id = format!("{}@{}", instance, addr);
    let mut node = Node::new(id, instance.to_owned(), addr);
    node.status = NodeStatus::Active;
    node.set_tasks(tasks.iter().map(|t| t.to_string()).collect());
    node
}

fn capability(runtime: &str, tasks: &[&str], precisions: &[&str], concurrency: u32) -> Capability {
    Capability {
        runtime: runtime.to_owned(),
        model_ids: vec![],
        tasks: tasks.iter()
            .map(|t| {
                TaskSpec {
                    name: t.to_string(),
                    extra: Default::default(),
                }
            })
            .collect(),
        precisions: precisions.iter().map(|p| p.to_string()).collect(),
        max_concurrency: concurrency,
        version: String::new(),
        extra: Default::default(),
    }
}

fn balancer(strategy: &str, cache: bool) -> LoadBalancer {
    let cfg = LoadBalancerConfig {
        strategy: Some(strategy.to_owned()),
        cache_enabled: Some(cache),
        ..Default::default()
    };
    LoadBalancer::new(cfg).unwrap()
}

#[test]
/// Six selections over three equal nodes rotate fairly.
fn round_robin_is_fair() {
    let lb = balancer("round_robin", false);
    lb.update(vec![active_node("a", 1, &["embed"]),
                   active_node("b", 2, &["embed"]),
                   active_node("c", 3, &["embed"])]);

    let picks: Vec<String> =
        (0..6).map(|_| lb.select_node("embed").unwrap().name).collect();
    assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
}

#[test]
/// The least-connections pick is the idle node; ties break by order.
fn least_connections_prefers_idle() {
    let lb = balancer("least_conn", false);
    let a = active_node("a", 1, &["embed"]);
    let b = active_node("b", 2, &["embed"]);
    let c = active_node("c", 3, &["embed"]);
    a.incr_connections();
    a.incr_connections();
    b.incr_connections();
    lb.update(vec![a, b, c]);

    assert_eq!(lb.select_node("embed").unwrap().name, "c");
}

#[test]
fn least_connections_ties_break_by_first_occurrence() {
    let mut s = strategy::by_name("least_conn").unwrap();
    let nodes = vec![active_node("a", 1, &["embed"]),
                     active_node("b", 2, &["embed"])];
    assert_eq!(s.select(&nodes, "embed"), Some(0));
}

#[test]
/// Selection never yields an inactive, erroring, or incapable node.
fn filter_excludes_unfit_nodes() {
    let lb = balancer("round_robin", false);
    let mut starting = active_node("a", 1, &["embed"]);
    starting.status = NodeStatus::Starting;
    let mut broken = active_node("b", 2, &["embed"]);
    broken.status = NodeStatus::Error;
    let wrong_task = active_node("c", 3, &["ocr"]);
    let fit = active_node("d", 4, &["embed"]);
    lb.update(vec![starting, broken, wrong_task, fit]);

    for _ in 0..4 {
        assert_eq!(lb.select_node("embed").unwrap().name, "d");
    }

    match lb.select_node("face_detection") {
        Err(Error::NoCandidates(task)) => assert_eq!(task, "face_detection"),
        other => panic!("expected no candidates, got {:?}", other.map(|n| n.id)),
    }
}

#[test]
/// With a non-positive total weight, the weighted strategy still picks.
fn weighted_degrades_to_uniform() {
    let mut s = strategy::by_name("weighted").unwrap();
    let mut a = active_node("a", 1, &["embed"]);
    let mut b = active_node("b", 2, &["embed"]);
    a.weight = 0.0;
    b.weight = 0.0;
    let nodes = vec![a, b];
    for _ in 0..16 {
        assert!(s.select(&nodes, "embed").is_some());
    }
}

#[test]
fn weighted_respects_dominant_weight() {
    let mut s = strategy::by_name("weighted").unwrap();
    let mut a = active_node("a", 1, &["embed"]);
    let mut b = active_node("b", 2, &["embed"]);
    a.weight = 1000.0;
    b.weight = 0.0;
    let nodes = vec![a, b];
    for _ in 0..16 {
        assert_eq!(s.select(&nodes, "embed"), Some(0));
    }
}

#[test]
/// Accelerator runtimes outscore CPU fallbacks; unsupported tasks score
/// below zero.
fn task_fit_ranks_runtimes() {
    let mut cuda = active_node("cuda", 1, &[]);
    cuda.set_capabilities(vec![capability("cuda", &["embed"], &["int8", "fp16"], 8)]);
    let mut cpu = active_node("cpu", 2, &[]);
    cpu.set_capabilities(vec![capability("cpu", &["embed"], &[], 2)]);

    let cuda_score = strategy::task_fit(&cuda, "embed");
    let cpu_score = strategy::task_fit(&cpu, "embed");
    assert!(cuda_score > cpu_score,
            "cuda {} should beat cpu {}",
            cuda_score,
            cpu_score);
    assert_eq!(strategy::task_fit(&cpu, "ocr"), -1.0);
}

#[test]
/// The task-aware wrapper sends the best-fitting node to its base.
fn task_aware_prefers_best_fit() {
    let mut s = strategy::by_name("task_aware:round_robin").unwrap();
    let mut cpu = active_node("cpu", 1, &[]);
    cpu.set_capabilities(vec![capability("cpu", &["embed"], &[], 2)]);
    let mut cuda = active_node("cuda", 2, &[]);
    cuda.set_capabilities(vec![capability("cuda", &["embed"], &["int8"], 8)]);

    // The cpu node comes first, but the first round-robin pick lands on
    // the higher-scored cuda node.
    let nodes = vec![cpu, cuda];
    assert_eq!(s.select(&nodes, "embed"), Some(1));
}

#[test]
fn unknown_strategy_is_rejected() {
    assert!(strategy::by_name("fastest_gpu_wins").is_err());
}

#[test]
/// A cached selection is reused while fresh.
fn cache_short_circuits_selection() {
    let lb = balancer("round_robin", true);
    lb.update(vec![active_node("a", 1, &["embed"]),
                   active_node("b", 2, &["embed"])]);

    let first = lb.select_node("embed").unwrap().name;
    for _ in 0..4 {
        assert_eq!(lb.select_node("embed").unwrap().name, first);
    }
    assert!(lb.stats().cache_hits >= 4);
}
