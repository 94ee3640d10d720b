//! Process tree discovery and sampling.

use std::collections::{HashMap, HashSet};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// Aggregated usage of a process and all of its descendants.
#[derive(Debug, Clone, Default)]
pub struct TreeUsage {
    pub rss_bytes: u64,
    pub cpu_percent: f64,
    pub pids: Vec<u32>,
}

/// Descendants of `root` (excluding `root`), deepest first.
///
/// Signalling in this order stops children before their parents get a chance
/// to respawn them.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    ordered_descendants(&system, Pid::from_u32(root))
        .into_iter()
        .map(|pid| pid.as_u32())
        .collect()
}

/// Live processes whose environment carries `key=value`.
///
/// Children inherit the tag, so this finds members that left the process
/// group or were reparented when their parent exited. Processes owned by
/// other users expose no environment and never match.
pub fn tagged(key: &str, value: &str) -> Vec<u32> {
    let needle = format!("{}={}", key, value);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_environ(UpdateKind::Always),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .filter(|(_, process)| process.environ().iter().any(|var| var == needle.as_str()))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn children_index(system: &System) -> HashMap<Pid, Vec<Pid>> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (proc_pid, process) in system.processes() {
        // Linux threads show up as tasks of their owning process; skip them.
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*proc_pid);
        }
    }
    children
}

fn ordered_descendants(system: &System, root: Pid) -> Vec<Pid> {
    let children = children_index(system);

    let mut by_depth: Vec<(usize, Pid)> = Vec::new();
    let mut stack = vec![(0usize, root)];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some((depth, current)) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if current != root {
            by_depth.push((depth, current));
        }
        if let Some(kids) = children.get(&current) {
            for child in kids {
                if !seen.contains(child) {
                    stack.push((depth + 1, *child));
                }
            }
        }
    }

    by_depth.sort_by(|a, b| b.0.cmp(&a.0));
    by_depth.into_iter().map(|(_, pid)| pid).collect()
}

/// Repeated sampler for one process tree.
///
/// CPU utilisation is a delta between two refreshes, so the first sample
/// always reports 0%.
pub struct TreeSampler {
    system: System,
    root: Pid,
}

impl TreeSampler {
    pub fn new(root: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(root),
        }
    }

    /// Returns `None` once the root has exited.
    pub fn sample(&mut self) -> Option<TreeUsage> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let root = self.system.process(self.root)?;
        if root.status() == ProcessStatus::Zombie {
            return None;
        }

        let mut usage = TreeUsage::default();
        let mut members = ordered_descendants(&self.system, self.root);
        members.push(self.root);
        for pid in members {
            if let Some(process) = self.system.process(pid) {
                if process.status() == ProcessStatus::Zombie {
                    continue;
                }
                usage.rss_bytes = usage.rss_bytes.saturating_add(process.memory());
                usage.cpu_percent += f64::from(process.cpu_usage());
                usage.pids.push(pid.as_u32());
            }
        }
        Some(usage)
    }
}
