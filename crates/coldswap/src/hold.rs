//! Per-command key holds: keys touched by an in-flight command are held
//! until the command resumes, keeping their lifecycles from overlapping.

use std::collections::HashMap;

#[derive(Default)]
pub struct KeyHolds {
    counts: HashMap<Vec<u8>, u64>,
    by_client: HashMap<u64, Vec<Vec<u8>>>,
}

impl KeyHolds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `key` on behalf of `client_id`.
    pub fn hold(&mut self, client_id: u64, key: &[u8]) {
        *self.counts.entry(key.to_vec()).or_insert(0) += 1;
        self.by_client
            .entry(client_id)
            .or_default()
            .push(key.to_vec());
    }

    /// Release every hold the client took for its current command.
    pub fn unhold_all(&mut self, client_id: u64) {
        let Some(keys) = self.by_client.remove(&client_id) else {
            return;
        };
        for key in keys {
            if let Some(count) = self.counts.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&key);
                }
            }
        }
    }

    pub fn is_held(&self, key: &[u8]) -> bool {
        self.counts.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_are_counted_and_released_per_client() {
        let mut holds = KeyHolds::new();
        holds.hold(1, b"k");
        holds.hold(2, b"k");
        holds.unhold_all(1);
        assert!(holds.is_held(b"k"), "second client still holds the key");
        holds.unhold_all(2);
        assert!(!holds.is_held(b"k"));
    }
}
