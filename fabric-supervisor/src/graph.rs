//! Dependency ordering over manifest descriptors.

use std::collections::{BTreeMap, BTreeSet};

use fabric_primitives::AgentName;

use crate::manifest::{AgentDescriptor, ManifestError, ManifestResult};

/// Computes a deterministic topological order over the descriptors.
///
/// Kahn's algorithm with the ready set kept sorted by name, so equal ranks
/// always come out in the same order. A non-empty remainder after the sort
/// is a cycle, reported with its participating agents.
///
/// # Errors
///
/// Returns [`ManifestError::Cycle`] when the graph is not acyclic.
pub fn topological_order(
    agents: &BTreeMap<AgentName, AgentDescriptor>,
) -> ManifestResult<Vec<AgentName>> {
    let mut in_degree: BTreeMap<&AgentName, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&AgentName>> = BTreeMap::new();
    for (name, descriptor) in agents {
        in_degree.entry(name).or_insert(0);
        for dependency in &descriptor.dependencies {
            *in_degree.entry(name).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(name);
        }
    }

    // BTreeSet keeps the ready set ordered by name.
    let mut ready: BTreeSet<&AgentName> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(agents.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.clone());
        for dependent in dependents.get(name.as_str()).into_iter().flatten() {
            let degree = in_degree
                .get_mut(dependent)
                .expect("all agents have a degree entry");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != agents.len() {
        let ordered: BTreeSet<&AgentName> = order.iter().collect();
        let members: Vec<String> = agents
            .keys()
            .filter(|name| !ordered.contains(name))
            .map(ToString::to_string)
            .collect();
        return Err(ManifestError::Cycle { members });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16, dependencies: &[&str]) -> AgentDescriptor {
        let text = format!(
            "executable = \"bin/x\"\nrequest_port = {port}\ndependencies = [{}]\n",
            dependencies
                .iter()
                .map(|d| format!("\"{d}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        toml::from_str(&text).expect("descriptor")
    }

    fn agents(entries: &[(&str, u16, &[&str])]) -> BTreeMap<AgentName, AgentDescriptor> {
        entries
            .iter()
            .map(|(name, port, deps)| (AgentName::new(*name).unwrap(), descriptor(*port, deps)))
            .collect()
    }

    #[test]
    fn chain_orders_leaves_first() {
        let agents = agents(&[
            ("c", 5590, &["b"][..]),
            ("b", 5580, &["a"][..]),
            ("a", 5570, &[][..]),
        ]);
        let order: Vec<String> = topological_order(&agents)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn independent_agents_come_out_by_name() {
        let agents = agents(&[
            ("zeta", 5590, &[][..]),
            ("alpha", 5570, &[][..]),
            ("mid", 5580, &[][..]),
        ]);
        let order: Vec<String> = topological_order(&agents)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn diamond_respects_both_branches() {
        let agents = agents(&[
            ("top", 5600, &["left", "right"][..]),
            ("left", 5580, &["base"][..]),
            ("right", 5590, &["base"][..]),
            ("base", 5570, &[][..]),
        ]);
        let order: Vec<String> = topological_order(&agents)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order[0], "base");
        assert_eq!(order[3], "top");
    }

    #[test]
    fn cycle_reports_members() {
        let agents = agents(&[
            ("a", 5570, &["b"][..]),
            ("b", 5580, &["c"][..]),
            ("c", 5590, &["a"][..]),
            ("free", 5600, &[][..]),
        ]);
        let err = topological_order(&agents).expect_err("cycle");
        let ManifestError::Cycle { members } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(members, ["a", "b", "c"]);
    }
}
