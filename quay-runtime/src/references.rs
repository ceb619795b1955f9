use quay_base::hashing::HashMap;

/// Global counts over the transitive dependency graph of loaded content.
/// A dependency (bundle) shared by several loaders is only eligible for
/// reclamation when its count drops back to zero.
#[derive(Default)]
pub struct ReferenceGraph {
    counts: HashMap<String, i32>,
}

impl ReferenceGraph {
    pub fn retain(
        &mut self,
        key: &str,
    ) -> i32 {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn release(
        &mut self,
        key: &str,
    ) -> i32 {
        match self.counts.get_mut(key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                let remaining = *count;
                if remaining == 0 {
                    self.counts.remove(key);
                }
                remaining
            }
            _ => {
                log::error!("release of untracked reference {}", key);
                0
            }
        }
    }

    pub fn count(
        &self,
        key: &str,
    ) -> i32 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}
