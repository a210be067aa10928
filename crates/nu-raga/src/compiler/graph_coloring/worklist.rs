//! Intrusive worklists over the node and move arenas
//!
//! Every node and move sits in at most one bucket at a time. Buckets are
//! doubly linked through index fields stored in the elements themselves, so
//! push, pop and removal from the middle are all O(1) and never allocate.
//!
//! Each move is additionally threaded on the move lists of its two
//! endpoints: link slot `i` of a move chains it into the list of `node[i]`.

use std::fmt;

use super::*;

/// Bucket membership of one arena element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct Links {
    prev: Option<usize>,
    next: Option<usize>,
    listed: bool,
}

/// One slot of a move's per-endpoint threading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct NodeMoveLink {
    prev: Option<MoveId>,
    next: Option<MoveId>,
}

/// An arena element that can be kept on a [`WorkList`]
pub(super) trait Listed {
    type State: Copy + PartialEq + fmt::Debug;

    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);
}

/// A LIFO bucket of arena indices whose members all carry `state`
#[derive(Debug)]
pub(super) struct WorkList<S> {
    state: S,
    head: Option<usize>,
    len: usize,
}

impl<S: Copy + PartialEq + fmt::Debug> WorkList<S> {
    pub(super) fn new(state: S) -> Self {
        Self {
            state,
            head: None,
            len: 0,
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    /// Push `id` and give it this bucket's state
    pub(super) fn push<T: Listed<State = S>>(&mut self, arena: &mut [T], id: usize) {
        assert!(
            !arena[id].links().listed,
            "element {} pushed on {:?} while still listed",
            id,
            self.state
        );
        if let Some(head) = self.head {
            arena[head].links_mut().prev = Some(id);
        }
        *arena[id].links_mut() = Links {
            prev: None,
            next: self.head,
            listed: true,
        };
        arena[id].set_state(self.state);
        self.head = Some(id);
        self.len += 1;
    }

    /// Pop the most recently pushed element. Its state is left unchanged.
    pub(super) fn pop<T: Listed<State = S>>(&mut self, arena: &mut [T]) -> Option<usize> {
        let id = self.head?;
        debug_assert_eq!(arena[id].state(), self.state);
        self.unlink(arena, id);
        Some(id)
    }

    /// Remove `id` from anywhere in the bucket
    pub(super) fn remove<T: Listed<State = S>>(&mut self, arena: &mut [T], id: usize) {
        assert_eq!(
            arena[id].state(),
            self.state,
            "element {} is not on the {:?} list",
            id,
            self.state
        );
        self.unlink(arena, id);
    }

    fn unlink<T: Listed<State = S>>(&mut self, arena: &mut [T], id: usize) {
        let Links { prev, next, listed } = *arena[id].links();
        assert!(listed, "element {} is not listed", id);
        match prev {
            Some(prev) => arena[prev].links_mut().next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            arena[next].links_mut().prev = prev;
        }
        *arena[id].links_mut() = Links::default();
        self.len -= 1;
    }

    pub(super) fn iter<'a, T: Listed<State = S>>(
        &self,
        arena: &'a [T],
    ) -> impl Iterator<Item = usize> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = arena[id].links().next;
            Some(id)
        })
    }
}

impl Listed for RagaNode {
    type State = NodeState;

    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }
}

impl Listed for MoveInfo {
    type State = MoveState;

    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }

    fn state(&self) -> MoveState {
        self.state
    }

    fn set_state(&mut self, state: MoveState) {
        self.state = state;
    }
}

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Classify every Initial node by significance and move-relatedness
    pub(super) fn mk_worklist(&mut self) {
        while let Some(n) = self.initial.pop(&mut self.nodes) {
            if self.significant(n) {
                self.spill_work.push(&mut self.nodes, n);
            } else if self.move_related(n) {
                self.freeze_work.push(&mut self.nodes, n);
            } else {
                self.simplify_work.push(&mut self.nodes, n);
            }
        }
    }

    pub(super) fn move_related(&self, n: NodeId) -> bool {
        match self.nodes[n].movee_index {
            Some(idx) => {
                debug_assert!(
                    self.node_moves[0][idx].is_some() || self.node_moves[1][idx].is_some()
                );
                true
            }
            None => false,
        }
    }

    /// Thread move `m` onto the list of `n`, its endpoint `link`
    pub(super) fn add_node_move(&mut self, n: NodeId, m: MoveId, link: usize) {
        if self.omits_hard_regs() && self.nodes[n].state == NodeState::Precolored {
            return;
        }
        let idx = match self.nodes[n].movee_index {
            Some(idx) => idx,
            None => {
                let idx = self.movee_count;
                self.movee_count += 1;
                if idx >= self.node_moves[0].len() {
                    self.node_moves[0].push(None);
                    self.node_moves[1].push(None);
                }
                self.nodes[n].movee_index = Some(idx);
                idx
            }
        };
        let next = self.node_moves[link][idx];
        if let Some(next) = next {
            self.moves[next].node_links[link].prev = Some(m);
        }
        self.moves[m].node_links[link] = NodeMoveLink { prev: None, next };
        self.node_moves[link][idx] = Some(m);
    }

    /// Detach and return one move of `n`
    pub(super) fn pop_node_move(&mut self, n: NodeId) -> Option<MoveId> {
        assert_ne!(self.nodes[n].state, NodeState::Precolored);
        let idx = self.nodes[n].movee_index?;

        let mut empty_lists = 0;
        let mut result = None;
        for link in 0..2 {
            match self.node_moves[link][idx] {
                None => empty_lists += 1,
                Some(_) if result.is_some() => {}
                Some(m) => {
                    debug_assert_eq!(self.moves[m].node_links[link].prev, None);
                    let next = self.moves[m].node_links[link].next;
                    self.node_moves[link][idx] = next;
                    match next {
                        Some(next) => self.moves[next].node_links[link].prev = None,
                        None => empty_lists += 1,
                    }
                    self.moves[m].node_links[link] = NodeMoveLink::default();
                    result = Some(m);

                    // A move that coalescing turned into n <-> n is on both lists
                    if self.moves[m].node[0] == self.moves[m].node[1] {
                        self.unlink_node_move(idx, m, 1 - link);
                    }
                }
            }
        }
        if empty_lists == 2 {
            self.nodes[n].movee_index = None;
        }
        result
    }

    /// Unlink `m` from list `link` of movee slot `idx`; true if that list is
    /// now empty
    fn unlink_node_move(&mut self, idx: usize, m: MoveId, link: usize) -> bool {
        let NodeMoveLink { prev, next } = self.moves[m].node_links[link];
        let empty = match prev {
            None => {
                debug_assert_eq!(self.node_moves[link][idx], Some(m));
                self.node_moves[link][idx] = next;
                next.is_none()
            }
            Some(prev) => {
                self.moves[prev].node_links[link].next = next;
                false
            }
        };
        if let Some(next) = next {
            self.moves[next].node_links[link].prev = prev;
        }
        self.moves[m].node_links[link] = NodeMoveLink::default();
        empty
    }

    pub(super) fn remove_node_move(&mut self, n: NodeId, m: MoveId) {
        if self.omits_hard_regs() && self.nodes[n].state == NodeState::Precolored {
            return;
        }
        let Some(idx) = self.nodes[n].movee_index else {
            return;
        };
        let mut empty_lists = 0;
        for link in 0..2 {
            let empty = if self.moves[m].node[link] == n {
                self.unlink_node_move(idx, m, link)
            } else {
                self.node_moves[link][idx].is_none()
            };
            empty_lists += usize::from(empty);
        }
        if empty_lists == 2 {
            self.nodes[n].movee_index = None;
        }
    }

    /// Moves currently threaded on either list of `n`. A self-move appears
    /// twice.
    pub(super) fn node_move_ids(&self, n: NodeId) -> Vec<MoveId> {
        let mut ids = Vec::new();
        let Some(idx) = self.nodes[n].movee_index else {
            return ids;
        };
        for link in 0..2 {
            let mut cursor = self.node_moves[link][idx];
            while let Some(m) = cursor {
                ids.push(m);
                cursor = self.moves[m].node_links[link].next;
            }
        }
        ids
    }
}
