//! The solver's worklist: one of several pop disciplines, optionally with
//! a staging buffer (push into `next`, pop from `curr`, swap when `curr`
//! drains) so the solver makes wave-like passes over the graph.

use std::collections::{BTreeSet, VecDeque};

use super::config::WlOrder;
use super::heap::Heap;

#[derive(Clone, Debug)]
enum WlBuf {
    Fifo(VecDeque<u32>),
    Lifo(Vec<u32>),
    Id(BTreeSet<u32>),
    Prio(Heap),
}

impl WlBuf {
    fn new(order: WlOrder, num_nodes: u32) -> Self {
        match order {
            WlOrder::Fifo => WlBuf::Fifo(VecDeque::new()),
            WlOrder::Lifo => WlBuf::Lifo(vec![]),
            WlOrder::Id => WlBuf::Id(BTreeSet::new()),
            WlOrder::Prio => WlBuf::Prio(Heap::new(num_nodes)),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            WlBuf::Fifo(q) => q.is_empty(),
            WlBuf::Lifo(s) => s.is_empty(),
            WlBuf::Id(s) => s.is_empty(),
            WlBuf::Prio(h) => h.is_empty(),
        }
    }

    fn push(&mut self, n: u32, p: u32) {
        match self {
            WlBuf::Fifo(q) => q.push_back(n),
            WlBuf::Lifo(s) => s.push(n),
            WlBuf::Id(s) => {
                s.insert(n);
            }
            WlBuf::Prio(h) => {
                h.push(n, p);
            }
        }
    }

    fn pop(&mut self) -> u32 {
        assert!(!self.is_empty(), "trying to pop empty worklist");
        match self {
            WlBuf::Fifo(q) => q.pop_front().unwrap(),
            WlBuf::Lifo(s) => s.pop().unwrap(),
            WlBuf::Id(s) => {
                let n = *s.iter().next().unwrap();
                s.remove(&n);
                n
            }
            WlBuf::Prio(h) => h.pop().0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Worklist {
    dual: bool,
    curr: WlBuf,
    next: WlBuf,
}

impl Worklist {
    pub fn new(order: WlOrder, dual: bool, num_nodes: u32) -> Self {
        Worklist {
            dual,
            curr: WlBuf::new(order, num_nodes),
            next: WlBuf::new(order, num_nodes),
        }
    }

    /// Is the active buffer empty?
    pub fn empty(&self) -> bool {
        self.curr.is_empty()
    }

    /// Is there nothing left in either buffer?
    pub fn drained(&self) -> bool {
        self.curr.is_empty() && self.next.is_empty()
    }

    /// Switch to the staging buffer, and return true, if nothing remains in
    /// the current one.
    pub fn swap_if_empty(&mut self) -> bool {
        if self.dual {
            if self.curr.is_empty() {
                std::mem::swap(&mut self.curr, &mut self.next);
                return true;
            }
            false
        } else {
            self.curr.is_empty()
        }
    }

    /// Insert node `n` with priority `p` (ignored by non-priority orders).
    pub fn push(&mut self, n: u32, p: u32) {
        if self.dual {
            self.next.push(n, p);
        } else {
            self.curr.push(n, p);
        }
    }

    pub fn pop(&mut self) -> u32 {
        self.curr.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dual_buffer_swaps() {
        let mut wl = Worklist::new(WlOrder::Fifo, true, 8);
        wl.push(1, 0);
        wl.push(2, 0);
        assert!(wl.empty());
        assert!(!wl.drained());
        assert!(wl.swap_if_empty());
        assert_eq!(wl.pop(), 1);
        wl.push(3, 0);
        assert_eq!(wl.pop(), 2);
        assert!(wl.swap_if_empty());
        assert_eq!(wl.pop(), 3);
        assert!(wl.drained());
    }

    #[test]
    fn prio_pops_least_recently_fired() {
        let mut wl = Worklist::new(WlOrder::Prio, false, 8);
        wl.push(4, 9);
        wl.push(7, 2);
        wl.push(5, 4);
        assert_eq!(wl.pop(), 7);
        assert_eq!(wl.pop(), 5);
        assert_eq!(wl.pop(), 4);
    }
}
