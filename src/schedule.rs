//! Propagation Scheduler
//!
//! Builds the linear layer ordering consumed once per forward pass and once
//! (reversed) per backward pass. Pure graph code, kept free of device state
//! so it can be tested in isolation.

use std::collections::{HashSet, VecDeque};

use crate::layers::LayerId;

/// Reverse breadth-first traversal from the output roots back through the
/// `prev` links. Each popped layer is prepended to the result and visited at
/// most once, which yields a valid forward execution order (inputs first,
/// outputs last) and handles diamond-shaped graphs without duplicates.
pub fn build_order<F>(roots: &[LayerId], prev_of: F) -> Vec<LayerId>
where
    F: Fn(LayerId) -> Vec<LayerId>,
{
    let mut order = VecDeque::new();
    let mut queue: VecDeque<LayerId> = roots.iter().copied().collect();
    let mut visited: HashSet<LayerId> = roots.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        order.push_front(id);
        for prev in prev_of(id) {
            if visited.insert(prev) {
                queue.push_back(prev);
            }
        }
    }

    order.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> LayerId {
        LayerId(n)
    }

    fn position(order: &[LayerId], target: LayerId) -> usize {
        order.iter().position(|&l| l == target).unwrap()
    }

    #[test]
    fn chain_orders_inputs_first() {
        // 0 -> 1 -> 2
        let prev = |l: LayerId| match l.0 {
            2 => vec![id(1)],
            1 => vec![id(0)],
            _ => vec![],
        };
        let order = build_order(&[id(2)], prev);
        assert_eq!(order, vec![id(0), id(1), id(2)]);
    }

    #[test]
    fn diamond_visits_each_layer_once() {
        // A(0) -> B(1), A -> C(2), B -> D(3), C -> D
        let prev = |l: LayerId| match l.0 {
            3 => vec![id(1), id(2)],
            1 | 2 => vec![id(0)],
            _ => vec![],
        };
        let order = build_order(&[id(3)], prev);

        assert_eq!(order.len(), 4);
        let a = position(&order, id(0));
        let b = position(&order, id(1));
        let c = position(&order, id(2));
        let d = position(&order, id(3));
        assert!(a < b && a < c);
        assert!(b < d && c < d);
    }

    #[test]
    fn every_predecessor_appears_earlier() {
        // Two roots sharing a trunk: 0 -> 1 -> {2, 3}
        let prev = |l: LayerId| match l.0 {
            2 | 3 => vec![id(1)],
            1 => vec![id(0)],
            _ => vec![],
        };
        let order = build_order(&[id(2), id(3)], prev);
        assert_eq!(order.len(), 4);
        for (i, layer) in order.iter().enumerate() {
            for p in prev(*layer) {
                assert!(position(&order, p) < i, "{:?} after {:?}", p, layer);
            }
        }
    }

    #[test]
    fn empty_roots_give_empty_order() {
        assert!(build_order(&[], |_| vec![]).is_empty());
    }
}
