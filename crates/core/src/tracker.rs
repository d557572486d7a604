//! Ownership tracking over `status.resource`.
//!
//! The list has set semantics by reference tuple. The tracker keeps no state of
//! its own; a mutation is durable only after the status has been written.

use crate::{ChartStatus, Reference};

/// Union-insert. Returns whether the set changed.
pub fn add(status: &mut ChartStatus, reference: Reference) -> bool {
    if contains(status, &reference) {
        return false;
    }
    status.resource.push(reference);
    true
}

/// Returns whether a matching entry was removed.
pub fn remove(status: &mut ChartStatus, reference: &Reference) -> bool {
    let before = status.resource.len();
    status.resource.retain(|r| r != reference);
    before != status.resource.len()
}

pub fn contains(status: &ChartStatus, reference: &Reference) -> bool {
    status.resource.iter().any(|r| r == reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy(name: &str) -> Reference {
        Reference::new("Deployment", "apps/v1", "default", name)
    }

    #[test]
    fn add_is_a_set_union() {
        let mut st = ChartStatus::default();
        assert!(add(&mut st, deploy("a")));
        assert!(add(&mut st, deploy("b")));
        let before = st.resource.clone();
        assert!(!add(&mut st, deploy("a")));
        assert_eq!(st.resource, before);
    }

    #[test]
    fn tuples_differing_in_any_field_are_distinct() {
        let mut st = ChartStatus::default();
        add(&mut st, deploy("a"));
        add(&mut st, Reference::new("Deployment", "apps/v1", "other", "a"));
        add(&mut st, Reference::new("Deployment", "apps/v1beta1", "default", "a"));
        add(&mut st, Reference::new("Service", "apps/v1", "default", "a"));
        assert_eq!(st.resource.len(), 4);
    }

    #[test]
    fn remove_keeps_order_of_the_rest() {
        let mut st = ChartStatus::default();
        for n in ["a", "b", "c"] {
            add(&mut st, deploy(n));
        }
        assert!(remove(&mut st, &deploy("b")));
        assert!(!remove(&mut st, &deploy("b")));
        assert_eq!(st.resource, vec![deploy("a"), deploy("c")]);
        assert!(contains(&st, &deploy("c")));
        assert!(!contains(&st, &deploy("b")));
    }
}
