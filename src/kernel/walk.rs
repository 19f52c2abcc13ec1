//! Walkers over intrusive kernel collections.
//!
//! Kernel objects are chained together through link nodes embedded in the objects themselves
//! (`list_head`, `hlist_node`, `klist_node`, `rb_node`). The walkers follow the link nodes and
//! yield the address of the object that embeds each of them.
//!
//! All walkers are lazy, read-once and fused after the first error. They keep the set of nodes
//! already visited, so a corrupted (cyclic) structure ends the walk instead of looping forever.

use crate::error::Result;
use crate::memory::{container_of, KernelMemory};
use memflow::prelude::v1::Address;

use log::*;

use std::collections::{BTreeSet, VecDeque};

/// `list_head.next`
const LIST_NEXT: usize = 0;
/// `hlist_head.first`, `hlist_node.next`
const HLIST_NEXT: usize = 0;
/// `rb_root.rb_node`
const RB_ROOT_NODE: usize = 0;
const RB_RIGHT: usize = 8;
const RB_LEFT: usize = 16;

/// Circular doubly linked `list_head` walker.
pub struct ListIter<'a, M> {
    mem: &'a mut M,
    head: Address,
    link_offset: usize,
    first: Option<Address>,
    last: Option<Address>,
    visited: BTreeSet<Address>,
    done: bool,
}

impl<'a, M: KernelMemory> ListIter<'a, M> {
    /// Walks the list anchored at `head`, yielding `node - link_offset` for every node.
    pub fn new(mem: &'a mut M, head: Address, link_offset: usize) -> Self {
        Self {
            mem,
            head,
            link_offset,
            first: None,
            last: None,
            visited: BTreeSet::new(),
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Address>> {
        let prev = self.last.unwrap_or(self.head);
        let node = self.mem.read_addr(prev + LIST_NEXT)?;

        if node.is_null() || node == self.head || Some(node) == self.first {
            return Ok(None);
        }

        if !self.visited.insert(node) {
            warn!("list {:x} loops back to {:x}, stopping", self.head, node);
            return Ok(None);
        }

        self.first.get_or_insert(node);
        self.last = Some(node);

        Ok(Some(node))
    }
}

impl<'a, M: KernelMemory> Iterator for ListIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(node)) => {
                trace!("list node {:x}", node);
                Some(Ok(container_of(node, self.link_offset)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// `klist` walker.
///
/// A klist is a `list_head` of `klist_node`s; the objects embed the `klist_node`, so the link
/// sits one more offset (`klist_node.n_node`) inside them.
pub struct KlistIter<'a, M> {
    inner: ListIter<'a, M>,
}

impl<'a, M: KernelMemory> KlistIter<'a, M> {
    /// `k_list` and `n_node` are the offsets of `klist.k_list` and `klist_node.n_node`,
    /// `link_offset` the offset of the `klist_node` inside the element.
    pub fn new(
        mem: &'a mut M,
        klist: Address,
        k_list: usize,
        n_node: usize,
        link_offset: usize,
    ) -> Self {
        Self {
            inner: ListIter::new(mem, klist + k_list, link_offset + n_node),
        }
    }
}

impl<'a, M: KernelMemory> Iterator for KlistIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Singly linked `hlist` walker, terminated by a null `next`.
pub struct HlistIter<'a, M> {
    mem: &'a mut M,
    cursor: Address,
    link_offset: usize,
    visited: BTreeSet<Address>,
    done: bool,
}

impl<'a, M: KernelMemory> HlistIter<'a, M> {
    /// Walks the chain hanging off the `hlist_head` at `head`.
    pub fn new(mem: &'a mut M, head: Address, link_offset: usize) -> Self {
        Self {
            mem,
            cursor: head + HLIST_NEXT,
            link_offset,
            visited: BTreeSet::new(),
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Address>> {
        let node = self.mem.read_addr(self.cursor)?;

        if node.is_null() {
            return Ok(None);
        }

        if !self.visited.insert(node) {
            warn!("hlist loops back to {:x}, stopping", node);
            return Ok(None);
        }

        self.cursor = node + HLIST_NEXT;
        Ok(Some(node))
    }
}

impl<'a, M: KernelMemory> Iterator for HlistIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(node)) => Some(Ok(container_of(node, self.link_offset))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Breadth-first red-black tree walker.
///
/// Yields the root first, then every descendant level by level. The order says nothing about
/// the tree's sort key.
pub struct RbTreeIter<'a, M> {
    mem: &'a mut M,
    root: Option<Address>,
    queue: VecDeque<Address>,
    link_offset: usize,
    visited: BTreeSet<Address>,
    done: bool,
}

impl<'a, M: KernelMemory> RbTreeIter<'a, M> {
    /// Walks the tree of the `rb_root` at `root`.
    pub fn new(mem: &'a mut M, root: Address, link_offset: usize) -> Self {
        Self {
            mem,
            root: Some(root),
            queue: VecDeque::new(),
            link_offset,
            visited: BTreeSet::new(),
            done: false,
        }
    }

    /// Walks the subtree starting at the `rb_node` at `node`, including `node` itself.
    pub fn from_node(mem: &'a mut M, node: Address, link_offset: usize) -> Self {
        let mut queue = VecDeque::new();
        if !node.is_null() {
            queue.push_back(node);
        }

        Self {
            mem,
            root: None,
            queue,
            link_offset,
            visited: BTreeSet::new(),
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Address>> {
        if let Some(root) = self.root.take() {
            let node = self.mem.read_addr(root + RB_ROOT_NODE)?;
            if !node.is_null() {
                self.queue.push_back(node);
            }
        }

        while let Some(node) = self.queue.pop_front() {
            if !self.visited.insert(node) {
                warn!("rb node {:x} reached twice, skipping", node);
                continue;
            }

            for child in [RB_LEFT, RB_RIGHT].iter() {
                let child = self.mem.read_addr(node + *child)?;
                if !child.is_null() {
                    self.queue.push_back(child);
                }
            }

            return Ok(Some(node));
        }

        Ok(None)
    }
}

impl<'a, M: KernelMemory> Iterator for RbTreeIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.advance() {
            Ok(Some(node)) => {
                trace!("rb node {:x}", node);
                Some(Ok(container_of(node, self.link_offset)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
