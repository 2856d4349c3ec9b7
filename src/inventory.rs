//! Program inventories per image and the derived block set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Programs found on each image's `PATH` plus their cross-image counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInventory {
    programs: BTreeMap<String, BTreeSet<String>>,
    counts: BTreeMap<String, usize>,
}

impl ProgramInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.programs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.programs.keys()
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.programs.get(key)
    }

    pub fn count(&self, program: &str) -> usize {
        self.counts.get(program).copied().unwrap_or(0)
    }

    pub fn unique_programs(&self) -> usize {
        self.counts.len()
    }

    /// Stores the programs of one image.
    ///
    /// Each program is counted once per image. Recording an image that is
    /// already known replaces its set and moves the counts with it, so a
    /// repeated scan never inflates the totals.
    pub fn record(&mut self, key: &str, programs: BTreeSet<String>) {
        if let Some(previous) = self.programs.remove(key) {
            for program in &previous {
                if let Some(count) = self.counts.get_mut(program) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.counts.remove(program);
                    }
                }
            }
        }
        for program in &programs {
            *self.counts.entry(program.clone()).or_insert(0) += 1;
        }
        debug!(url = key, count = programs.len(), "recorded unique programs");
        self.programs.insert(key.to_string(), programs);
    }

    /// Drops an image and its contribution to the counts.
    pub fn forget(&mut self, key: &str) {
        self.record(key, BTreeSet::new());
        self.programs.remove(key);
    }

    /// Programs to hide from generated modules.
    ///
    /// A program is blocked when it appears in at least `percentile` percent
    /// of the scanned images or in any baseline image. `permit` always wins.
    pub fn block_set(
        &self,
        percentile: f64,
        baseline: &[String],
        permit: &BTreeSet<String>,
        always_blocked: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let threshold = percentile * self.programs.len() as f64 / 100.0;
        info!(percentile, "excluding programs found in at least this percent of images");
        debug!(
            images = self.programs.len(),
            programs = self.counts.len(),
            threshold = %format!("{threshold:.2}"),
            "computing block set"
        );

        let mut blocked: BTreeSet<String> = always_blocked.clone();
        for key in baseline {
            if let Some(programs) = self.programs.get(key) {
                blocked.extend(programs.iter().cloned());
            }
        }
        blocked.extend(
            self.counts
                .iter()
                .filter(|(_, count)| **count as f64 >= threshold)
                .map(|(program, _)| program.clone()),
        );
        blocked.retain(|program| !permit.contains(program));
        info!(blocked = blocked.len(), total = self.counts.len(), "excluded programs");
        blocked
    }

    /// Sorted programs of `key`, minus `block` when given.
    pub fn programs(&self, key: &str, block: Option<&BTreeSet<String>>) -> Vec<String> {
        let Some(programs) = self.programs.get(key) else {
            return Vec::new();
        };
        match block {
            Some(block) => programs.difference(block).cloned().collect(),
            None => programs.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn four_images() -> ProgramInventory {
        let mut inventory = ProgramInventory::new();
        inventory.record("a", set(&["x", "ls", "bwa"]));
        inventory.record("b", set(&["x", "ls", "bwa"]));
        inventory.record("c", set(&["ls", "bwa"]));
        inventory.record("d", set(&["ls", "samtools"]));
        inventory
    }

    #[test]
    fn threshold_is_not_rounded() {
        let inventory = four_images();
        let none = BTreeSet::new();
        assert!(inventory.block_set(50.0, &[], &none, &none).contains("x"));
        assert!(!inventory.block_set(51.0, &[], &none, &none).contains("x"));
    }

    #[test]
    fn permitted_programs_are_never_blocked() {
        let inventory = four_images();
        let none = BTreeSet::new();
        let blocked = inventory.block_set(50.0, &[], &set(&["bwa"]), &none);
        assert!(!blocked.contains("bwa"));
        assert!(blocked.contains("ls"));
    }

    #[test]
    fn baseline_programs_and_builtins_are_blocked() {
        let inventory = four_images();
        let blocked =
            inventory.block_set(100.0, &["d".to_string()], &BTreeSet::new(), &set(&["time"]));
        assert_eq!(blocked, set(&["ls", "samtools", "time"]));
    }

    #[test]
    fn rerecording_does_not_double_count() {
        let mut inventory = four_images();
        inventory.record("a", set(&["x", "ls", "bwa"]));
        assert_eq!(inventory.count("x"), 2);
        assert_eq!(inventory.count("ls"), 4);
        inventory.record("a", set(&["ls"]));
        assert_eq!(inventory.count("x"), 1);
        assert_eq!(inventory.count("bwa"), 2);
    }

    #[test]
    fn forget_removes_image_and_counts() {
        let mut inventory = four_images();
        inventory.forget("d");
        assert!(!inventory.contains("d"));
        assert_eq!(inventory.count("samtools"), 0);
        assert_eq!(inventory.len(), 3);
    }

    #[test]
    fn programs_filters_block_set() {
        let inventory = four_images();
        let block = set(&["ls"]);
        assert_eq!(inventory.programs("a", Some(&block)), vec!["bwa", "x"]);
        assert_eq!(inventory.programs("a", None), vec!["bwa", "ls", "x"]);
        assert!(inventory.programs("missing", None).is_empty());
    }
}
