use std::sync::Mutex;

use crate::time::Time;

/// Generates unique goal identifiers for one node.
///
/// All action clients of a node share one generator so counters never
/// collide; the counter sits behind a mutex for exactly that reason.
pub struct GoalIdGenerator {
    node_name: String,
    goals: Mutex<u64>,
}

impl GoalIdGenerator {
    pub fn new(node_name: &str) -> Self {
        GoalIdGenerator {
            node_name: node_name.to_string(),
            goals: Mutex::new(0),
        }
    }

    /// The next ID: `<nodeName>-<counter>-<sec>-<nsec>`.
    pub fn generate(&self) -> String {
        self.next_id(Time::now())
    }

    fn next_id(&self, now: Time) -> String {
        let mut goals = self.goals.lock().expect("goal counter mutex poisoned");
        *goals += 1;

        format!("{}-{}-{}-{}", self.node_name, *goals, now.sec, now.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_the_documented_format() {
        let generator = GoalIdGenerator::new("/talker");
        let stamp = Time::new(1000, 0);

        assert_eq!(generator.next_id(stamp), "/talker-1-1000-0");
        assert_eq!(generator.next_id(stamp), "/talker-2-1000-0");
        assert_eq!(generator.next_id(Time::new(1000, 7)), "/talker-3-1000-7");
    }

    #[test]
    fn counter_is_shared_across_threads() {
        let generator = std::sync::Arc::new(GoalIdGenerator::new("/node"));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let generator = generator.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    generator.generate();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(generator.next_id(Time::new(0, 0)), "/node-101-0-0");
    }
}
