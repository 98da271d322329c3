//! AVL tree of distinct jump targets, keyed by bytecode offset.
//!
//! Every resolved span dependency points at a node here instead of holding a
//! raw offset, so that when the resolver widens a jump it can move all targets
//! above the widened immediate with one walk. Nodes live in an arena and are
//! addressed by [`TargetId`]; clearing the tree threads every node onto a free
//! list that later insertions draw from.

use crate::error::{EmitError, EmitResult};

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// Index of a node in the jump-target arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TargetId(u32);

impl TargetId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct JumpTarget {
    offset: usize,
    /// Height of the right subtree minus height of the left subtree.
    balance: i8,
    kids: [Option<TargetId>; 2],
}

#[derive(Debug, Default, Clone)]
pub(crate) struct JumpTargets {
    nodes: Vec<JumpTarget>,
    root: Option<TargetId>,
    /// Free nodes, linked through their left child.
    free: Option<TargetId>,
    len: usize,
}

impl JumpTargets {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct targets currently in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self, id: TargetId) -> usize {
        self.node(id).offset
    }

    /// Returns the node for `offset`, inserting it if it is new.
    pub fn insert(&mut self, offset: usize) -> EmitResult<TargetId> {
        let mut found = None;
        let (root, _) = self.add(self.root, offset, &mut found)?;
        self.root = Some(root);
        // `add` always records the node it found or created
        Ok(found.unwrap_or(root))
    }

    /// Adds `delta` to the offset of every target strictly above `pivot`.
    ///
    /// Offsets are monotonic in tree order and every shifted node moves by
    /// the same amount, so the ordering survives the walk.
    pub fn shift_above(&mut self, pivot: usize, delta: usize) {
        if let Some(root) = self.root {
            self.shift(root, pivot, delta);
        }
    }

    /// Returns every node to the free list and empties the tree.
    pub fn clear(&mut self) {
        if let Some(root) = self.root.take() {
            self.release(root);
        }
        self.len = 0;
    }

    /// Target offsets in ascending order.
    #[cfg(test)]
    pub fn offsets(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cursor = self.root;
        while cursor.is_some() || !stack.is_empty() {
            while let Some(id) = cursor {
                stack.push(id);
                cursor = self.node(id).kids[LEFT];
            }
            if let Some(id) = stack.pop() {
                out.push(self.node(id).offset);
                cursor = self.node(id).kids[RIGHT];
            }
        }
        out
    }

    /// Height of the tree, checking the stored balance factors on the way.
    ///
    /// Returns `None` if any balance factor is stale or outside `-1..=1`.
    #[cfg(test)]
    pub fn checked_height(&self) -> Option<usize> {
        self.root.map_or(Some(0), |root| self.check(root))
    }

    #[cfg(test)]
    fn check(&self, id: TargetId) -> Option<usize> {
        let node = self.node(id);
        let lh = node.kids[LEFT].map_or(Some(0), |kid| self.check(kid))?;
        let rh = node.kids[RIGHT].map_or(Some(0), |kid| self.check(kid))?;
        let actual = i64::try_from(rh).ok()? - i64::try_from(lh).ok()?;
        (i64::from(node.balance) == actual && (-1..=1).contains(&actual)).then_some(1 + lh.max(rh))
    }

    fn node(&self, id: TargetId) -> &JumpTarget {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: TargetId) -> &mut JumpTarget {
        &mut self.nodes[id.index()]
    }

    fn alloc(&mut self, offset: usize) -> EmitResult<TargetId> {
        let fresh = JumpTarget {
            offset,
            balance: 0,
            kids: [None, None],
        };
        if let Some(id) = self.free {
            self.free = self.node(id).kids[LEFT];
            *self.node_mut(id) = fresh;
            return Ok(id);
        }
        self.nodes.try_reserve(1)?;
        let id = TargetId(u32::try_from(self.nodes.len()).map_err(|_| EmitError::OutOfMemory)?);
        self.nodes.push(fresh);
        Ok(id)
    }

    /// Inserts below `link`, returning the subtree's new root and whether its
    /// height grew.
    fn add(&mut self, link: Option<TargetId>, offset: usize, found: &mut Option<TargetId>) -> EmitResult<(TargetId, bool)> {
        let Some(id) = link else {
            let id = self.alloc(offset)?;
            self.len += 1;
            *found = Some(id);
            return Ok((id, true));
        };

        let here = self.node(id).offset;
        if here == offset {
            *found = Some(id);
            return Ok((id, false));
        }

        let dir = if offset < here { LEFT } else { RIGHT };
        let (kid, grew) = self.add(self.node(id).kids[dir], offset, found)?;
        self.node_mut(id).kids[dir] = Some(kid);
        if !grew {
            return Ok((id, false));
        }

        let node = self.node_mut(id);
        node.balance += if dir == LEFT { -1 } else { 1 };
        if node.balance == 0 {
            return Ok((id, false));
        }
        let (root, height_changed) = self.rebalance(id);
        Ok((root, !height_changed))
    }

    /// Restores balance at `id` after an insertion, returning the new subtree
    /// root and whether a rotation shortened the subtree.
    fn rebalance(&mut self, id: TargetId) -> (TargetId, bool) {
        let balance = self.node(id).balance;
        let (dir, double) = if balance < -1 {
            let left = self.node(id).kids[LEFT].map_or(0, |kid| self.node(kid).balance);
            (RIGHT, left > 0)
        } else if balance > 1 {
            let right = self.node(id).kids[RIGHT].map_or(0, |kid| self.node(kid).balance);
            (LEFT, right < 0)
        } else {
            return (id, false);
        };
        let other = 1 - dir;

        let Some(child) = self.node(id).kids[other] else {
            return (id, false);
        };

        if double {
            let Some(root) = self.node(child).kids[dir] else {
                return (id, false);
            };
            let root_kids = self.node(root).kids;
            self.node_mut(id).kids[other] = root_kids[dir];
            self.node_mut(child).kids[dir] = root_kids[other];
            self.node_mut(root).kids[dir] = Some(id);
            self.node_mut(root).kids[other] = Some(child);

            let root_balance = self.node(root).balance;
            let (left, right) = if dir == LEFT { (id, child) } else { (child, id) };
            self.node_mut(left).balance = -root_balance.max(0);
            self.node_mut(right).balance = -root_balance.min(0);
            self.node_mut(root).balance = 0;
            (root, true)
        } else {
            let root = child;
            self.node_mut(id).kids[other] = self.node(root).kids[dir];
            self.node_mut(root).kids[dir] = Some(id);

            let height_changed = self.node(root).balance != 0;
            let root_node = self.node_mut(root);
            root_node.balance += if dir == LEFT { -1 } else { 1 };
            let new_balance = -root_node.balance;
            self.node_mut(id).balance = new_balance;
            (root, height_changed)
        }
    }

    fn shift(&mut self, id: TargetId, pivot: usize, delta: usize) {
        let [left, right] = self.node(id).kids;
        if self.node(id).offset > pivot {
            self.node_mut(id).offset += delta;
            if let Some(left) = left {
                self.shift(left, pivot, delta);
            }
        }
        if let Some(right) = right {
            self.shift(right, pivot, delta);
        }
    }

    fn release(&mut self, id: TargetId) {
        let [left, right] = self.node(id).kids;
        if let Some(left) = left {
            self.release(left);
        }
        if let Some(right) = right {
            self.release(right);
        }
        let free = self.free;
        let node = self.node_mut(id);
        node.kids = [free, None];
        self.free = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, seq::SliceRandom};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn log2_bound(n: usize) -> usize {
        // AVL height is below 1.44 * log2(n + 2)
        let bits = usize::BITS - (n + 2).leading_zeros();
        (bits as usize * 3).div_ceil(2)
    }

    #[test]
    fn reinserting_an_offset_returns_the_same_node() {
        let mut targets = JumpTargets::new();
        let a = targets.insert(40).unwrap();
        let b = targets.insert(10).unwrap();
        assert_eq!(targets.insert(40).unwrap(), a);
        assert_ne!(a, b);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.offset(b), 10);
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut targets = JumpTargets::new();
        for offset in 0..1000 {
            targets.insert(offset * 3).unwrap();
        }
        let height = targets.checked_height().expect("balance factors must be valid");
        assert!(height <= log2_bound(1000), "height {height}");
        assert_eq!(targets.offsets(), (0..1000).map(|o| o * 3).collect::<Vec<_>>());
    }

    #[test]
    fn random_insertion_orders_keep_the_avl_invariant() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        for round in 0..20 {
            let n = 50 + round * 37;
            let mut offsets: Vec<usize> = (0..n).map(|i| i * 7 + 1).collect();
            offsets.shuffle(&mut rng);
            let mut targets = JumpTargets::new();
            for (i, &offset) in offsets.iter().enumerate() {
                targets.insert(offset).unwrap();
                if i % 16 == 0 {
                    assert!(targets.checked_height().is_some(), "round {round} after {i} inserts");
                }
            }
            let height = targets.checked_height().expect("balanced");
            assert!(height <= log2_bound(n), "n={n} height={height}");
            offsets.sort_unstable();
            assert_eq!(targets.offsets(), offsets);
        }
    }

    #[test]
    fn shift_above_moves_only_targets_past_the_pivot() {
        let mut targets = JumpTargets::new();
        let ids: Vec<_> = [5, 30, 10, 50, 20, 40].iter().map(|&o| targets.insert(o).unwrap()).collect();
        targets.shift_above(20, 2);
        assert_eq!(targets.offsets(), vec![5, 10, 20, 32, 42, 52]);
        assert_eq!(targets.offset(ids[1]), 32);
        assert_eq!(targets.offset(ids[4]), 20);
        assert!(targets.checked_height().is_some());
    }

    #[test]
    fn cleared_nodes_are_reused() {
        let mut targets = JumpTargets::new();
        for offset in [1, 2, 3, 4] {
            targets.insert(offset).unwrap();
        }
        targets.clear();
        assert!(targets.is_empty());
        assert_eq!(targets.offsets(), Vec::<usize>::new());
        for offset in [9, 8, 7] {
            targets.insert(offset).unwrap();
        }
        assert_eq!(targets.nodes.len(), 4);
        assert_eq!(targets.offsets(), vec![7, 8, 9]);
    }
}
