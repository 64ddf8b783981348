//! Control-flow graph construction over decoded instructions.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::warn;
use serde::Serialize;

use crate::analysis::exceptions::ExceptionTable;
use crate::dex::descriptors::MethodDescriptor;
use crate::dex::error::{Context, DexError};
use crate::dex::instructions::{DecodedInstruction, Operands};
use crate::dex::opcodes::Family;

pub type BlockId = usize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Code-unit offsets of the instructions, in order.
    pub instructions: Vec<u32>,
    /// Normal-flow predecessors.
    pub preds: Vec<BlockId>,
    /// Normal-flow successors.
    pub succs: Vec<BlockId>,
    /// Handler blocks reachable by an exception raised in this block.
    pub handlers: Vec<BlockId>,
    /// Blocks whose exceptions land here.
    pub exception_preds: Vec<BlockId>,
    pub is_handler: bool,
}

impl BasicBlock {
    fn new(id: BlockId) -> BasicBlock {
        BasicBlock {
            id,
            instructions: vec![],
            preds: vec![],
            succs: vec![],
            handlers: vec![],
            exception_preds: vec![],
            is_handler: false,
        }
    }

    pub fn first_offset(&self) -> Result<u32, DexError> {
        match self.instructions.first() {
            Some(o) => Ok(*o),
            None => fail!(kind = Structural, "block {} has no instructions", self.id),
        }
    }

    pub fn last_offset(&self) -> Result<u32, DexError> {
        match self.instructions.last() {
            Some(o) => Ok(*o),
            None => fail!(kind = Structural, "block {} has no instructions", self.id),
        }
    }

    /// Normal and exceptional successors.
    pub fn all_successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.succs.iter().chain(self.handlers.iter()).copied()
    }

    /// A block that leaves the method: no normal successors.
    pub fn is_exit(&self) -> bool {
        self.succs.is_empty()
    }
}

fn push_unique(v: &mut Vec<BlockId>, id: BlockId) {
    if !v.contains(&id) {
        v.push(id);
    }
}

#[derive(Debug)]
pub struct Cfg<'m> {
    insns: &'m [Option<DecodedInstruction>],
    blocks: Vec<BasicBlock>,
    block_at: HashMap<u32, BlockId>,
    exceptions: ExceptionTable,
    register_count: u16,
}

impl<'m> Cfg<'m> {
    /// Builds the graph for a method, decoding it if needed.
    pub fn build(method: &'m MethodDescriptor) -> Result<Cfg<'m>, DexError> {
        let insns = method.decode()?;
        let exceptions = match method.code() {
            Some(code) => ExceptionTable::build(code)?,
            None => ExceptionTable::default(),
        };
        Cfg::from_parts(insns, method.registers_size(), exceptions).context(|| method.to_string())
    }

    pub fn from_parts(
        insns: &'m [Option<DecodedInstruction>],
        register_count: u16,
        exceptions: ExceptionTable,
    ) -> Result<Cfg<'m>, DexError> {
        if !matches!(insns.first(), Some(Some(_))) {
            fail!(kind = Structural, "method has no entry instruction");
        }
        let len = insns.len() as u32;
        let is_insn = |o: u32| matches!(insns.get(o as usize), Some(Some(_)));

        // Leaders: entry, branch targets, try boundaries and handler addresses.
        // The instruction after a terminator is handled during the scan.
        let mut leaders: BTreeSet<u32> = BTreeSet::new();
        leaders.insert(0);
        for insn in insns.iter().flatten() {
            leaders.extend(insn.branch_targets());
        }
        for handler in exceptions.handlers() {
            if !is_insn(handler.address) {
                fail!(at = handler.address as usize, "Exception handler at {:04x} is not an instruction boundary", handler.address);
            }
        }
        leaders.extend(exceptions.boundaries().filter(|o| is_insn(*o)));

        let mut blocks: Vec<BasicBlock> = vec![];
        let mut block_at = HashMap::new();
        let mut ended = true;
        for insn in insns.iter().flatten() {
            if ended || leaders.contains(&insn.offset) {
                let id = blocks.len();
                blocks.push(BasicBlock::new(id));
                block_at.insert(insn.offset, id);
            }
            if let Some(b) = blocks.last_mut() {
                b.instructions.push(insn.offset);
            }
            ended = insn.ends_block();
        }

        let target_block = |from: &DecodedInstruction, target: u32| -> Result<BlockId, DexError> {
            match block_at.get(&target) {
                Some(id) => Ok(*id),
                None if target >= len => Err(err!(kind = Structural, "{} falls off the end of the method", from.opcode.name).at(from.offset as usize)),
                None => Err(err!(kind = Structural, "no block starts at {:04x}", target).at(from.offset as usize)),
            }
        };

        // Edges are resolved only for blocks reachable from the entry. An
        // alignment nop in front of a payload is never reached, and its
        // fall-through has no block to land on.
        let mut reached = vec![false; blocks.len()];
        let mut queue = VecDeque::from([0]);
        reached[0] = true;
        while let Some(b) = queue.pop_front() {
            let last = blocks[b].last_offset()?;
            let Some(insn) = insns[last as usize].as_ref() else {
                fail!(kind = Structural, "block {} ends outside an instruction", b);
            };
            let mut succs = vec![];
            match (&insn.family(), &insn.operands) {
                (Family::Return(_) | Family::ReturnVoid | Family::Throw, _) => {}
                (Family::Goto, Operands::Branch { target, .. }) => succs.push(target_block(insn, *target)?),
                (Family::If(_) | Family::IfZ(_), Operands::Branch { target, .. }) => {
                    push_unique(&mut succs, target_block(insn, insn.next_offset())?);
                    push_unique(&mut succs, target_block(insn, *target)?);
                }
                (Family::Switch, Operands::Switch { cases, .. }) => {
                    for (_, target) in cases {
                        push_unique(&mut succs, target_block(insn, *target)?);
                    }
                    push_unique(&mut succs, target_block(insn, insn.next_offset())?);
                }
                _ => succs.push(target_block(insn, insn.next_offset())?),
            }

            // exception edges from blocks that can throw inside a try region
            let mut handlers = vec![];
            let throws = blocks[b]
                .instructions
                .iter()
                .filter_map(|o| insns[*o as usize].as_ref())
                .any(|i| i.opcode.can_throw());
            if throws {
                if let Some(region) = exceptions.region_at(blocks[b].first_offset()?) {
                    for clause in &region.clauses {
                        if let Some(h) = block_at.get(&clause.address).copied() {
                            push_unique(&mut handlers, h);
                            blocks[h].is_handler = true;
                        }
                    }
                }
            }

            for next in succs.iter().chain(handlers.iter()) {
                if !reached[*next] {
                    reached[*next] = true;
                    queue.push_back(*next);
                }
            }
            blocks[b].succs = succs;
            blocks[b].handlers = handlers;
        }

        let mut cfg = Cfg { insns, blocks, block_at, exceptions, register_count };
        cfg.prune();
        Ok(cfg)
    }

    /// Drops blocks unreachable from the entry, renumbers the rest densely and
    /// fills in predecessor lists.
    fn prune(&mut self) {
        let mut seen = vec![false; self.blocks.len()];
        let mut queue = VecDeque::from([0]);
        seen[0] = true;
        while let Some(b) = queue.pop_front() {
            for s in self.blocks[b].all_successors() {
                if !seen[s] {
                    seen[s] = true;
                    queue.push_back(s);
                }
            }
        }

        let dropped = seen.iter().filter(|s| !**s).count();
        if dropped > 0 {
            warn!("dropping {} unreachable blocks", dropped);
        }

        let mut remap = vec![usize::MAX; self.blocks.len()];
        let mut next = 0;
        for (old, keep) in seen.iter().enumerate() {
            if *keep {
                remap[old] = next;
                next += 1;
            }
        }

        let old_blocks = std::mem::take(&mut self.blocks);
        for (old, mut block) in old_blocks.into_iter().enumerate() {
            if !seen[old] {
                continue;
            }
            block.id = remap[old];
            block.succs = block.succs.iter().map(|s| remap[*s]).collect();
            block.handlers = block.handlers.iter().map(|s| remap[*s]).collect();
            block.preds.clear();
            block.exception_preds.clear();
            self.blocks.push(block);
        }
        for b in 0..self.blocks.len() {
            for s in self.blocks[b].succs.clone() {
                push_unique(&mut self.blocks[s].preds, b);
            }
            for h in self.blocks[b].handlers.clone() {
                push_unique(&mut self.blocks[h].exception_preds, b);
            }
        }
        self.block_at = self
            .blocks
            .iter()
            .filter_map(|b| b.instructions.first().map(|o| (*o, b.id)))
            .collect();
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block starting at `offset`, if any.
    pub fn block_at(&self, offset: u32) -> Option<BlockId> {
        self.block_at.get(&offset).copied()
    }

    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    pub fn exceptions(&self) -> &ExceptionTable {
        &self.exceptions
    }

    pub fn instruction(&self, offset: u32) -> Option<&'m DecodedInstruction> {
        self.insns.get(offset as usize).and_then(|i| i.as_ref())
    }

    pub fn instructions(&self, id: BlockId) -> impl Iterator<Item = &'m DecodedInstruction> + '_ {
        let insns = self.insns;
        self.blocks[id].instructions.iter().filter_map(move |o| insns[*o as usize].as_ref())
    }

    pub fn exits(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().filter(|b| b.is_exit()).map(|b| b.id)
    }

    /// Blocks in reverse postorder of a depth-first walk from the entry,
    /// following normal edges before handler edges.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        let mut stack: Vec<(BlockId, usize)> = vec![(0, 0)];
        visited[0] = true;
        while let Some((b, next)) = stack.pop() {
            let succs: Vec<BlockId> = self.blocks[b].all_successors().collect();
            if next < succs.len() {
                stack.push((b, next + 1));
                let s = succs[next];
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                order.push(b);
            }
        }
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::exceptions::CatchClause;
    use crate::dex::decoder::decode_method;
    use crate::dex::error::ErrorKind;

    #[test]
    fn single_block()
    {
        let insns = decode_method(&[0x0290, 0x0100, 0x020f], 3).unwrap();
        let cfg = Cfg::from_parts(&insns, 3, ExceptionTable::default()).unwrap();
        assert_eq!(cfg.block_count(), 1);
        assert!(cfg.block(0).succs.is_empty());
        assert_eq!(cfg.block(0).instructions, vec![0, 2]);
        assert_eq!(cfg.exits().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn diamond()
    {
        // 0: if-eqz v0, +4 ; 2: const/4 v0, 1 ; 3: goto +2 ; 4: const/4 v0, 2 ; 5: return v0
        let code = [0x0038, 0x0004, 0x1012, 0x0228, 0x2012, 0x000f];
        let insns = decode_method(&code, 1).unwrap();
        let cfg = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap();
        assert_eq!(cfg.block_count(), 4);
        assert_eq!(cfg.block(0).succs, vec![1, 2]);
        assert_eq!(cfg.block(1).succs, vec![3]);
        assert_eq!(cfg.block(2).succs, vec![3]);
        assert_eq!(cfg.block(3).preds, vec![1, 2]);
        assert_eq!(cfg.block_at(4), Some(2));
        assert_eq!(cfg.reverse_postorder()[0], 0);
        assert_eq!(*cfg.reverse_postorder().last().unwrap(), 3);
    }

    #[test]
    fn branch_to_fallthrough_is_one_edge()
    {
        // 0: if-eqz v0, +2 ; 2: return-void
        let insns = decode_method(&[0x0038, 0x0002, 0x000e], 1).unwrap();
        let cfg = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap();
        assert_eq!(cfg.block(0).succs, vec![1]);
    }

    #[test]
    fn unreachable_blocks_are_pruned()
    {
        // 0: return-void ; 1: const/4 v0, 0 ; 2: return-void
        let insns = decode_method(&[0x000e, 0x0012, 0x000e], 1).unwrap();
        let cfg = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap();
        assert_eq!(cfg.block_count(), 1);
        assert!(cfg.block_at(1).is_none());
    }

    #[test]
    fn falling_off_the_end_is_structural()
    {
        let insns = decode_method(&[0x0012], 1).unwrap();
        let e = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);
    }

    #[test]
    fn empty_block_ordering_is_structural()
    {
        let b = BasicBlock::new(3);
        assert_eq!(b.first_offset().unwrap_err().kind(), ErrorKind::Structural);
    }

    #[test]
    fn handler_edges_only_from_throwing_blocks()
    {
        // 0: const/4 v0, 0 ; 1: goto +2 ; 2: return-void (handler) ; 3: throw v0
        // the try covers 0..4; block [0,1] cannot throw, block [3] can
        let insns = decode_method(&[0x0012, 0x0228, 0x000e, 0x0027], 1).unwrap();
        let mut table = ExceptionTable::default();
        table.add_region(0, 4, vec![CatchClause { catch_type: None, address: 2 }]);
        let cfg = Cfg::from_parts(&insns, 1, table).unwrap();

        let handler = cfg.block_at(2).unwrap();
        let thrower = cfg.block_at(3).unwrap();
        assert!(cfg.block(handler).is_handler);
        assert!(cfg.block(0).handlers.is_empty());
        assert_eq!(cfg.block(thrower).handlers, vec![handler]);
        assert_eq!(cfg.block(handler).exception_preds, vec![thrower]);
    }

    #[test]
    fn switch_edges()
    {
        // 0: packed-switch v0, +6 ; 3: return-void ; 4: const/4 v0, 0 ; 5: return-void ; 6: payload -> cases 4, 4
        let code = [0x002b, 0x0006, 0x0000, 0x000e, 0x0012, 0x000e, 0x0100, 0x0002, 0x0000, 0x0000, 0x0004, 0x0000, 0x0004, 0x0000];
        let insns = decode_method(&code, 1).unwrap();
        let cfg = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap();
        let case = cfg.block_at(4).unwrap();
        let fallthrough = cfg.block_at(3).unwrap();
        assert_eq!(cfg.block(0).succs, vec![case, fallthrough]);
    }

    #[test]
    fn alignment_nop_before_payload()
    {
        // 0: fill-array-data v0, +6 ; 3: move v0, v0 ; 4: return-void ; 5: nop ; 6: array payload
        let code = [0x0026, 0x0006, 0x0000, 0x0001, 0x000e, 0x0000, 0x0300, 0x0001, 0x0002, 0x0000, 0x0201];
        let insns = decode_method(&code, 1).unwrap();
        let cfg = Cfg::from_parts(&insns, 1, ExceptionTable::default()).unwrap();
        assert_eq!(cfg.block_count(), 1);
        assert_eq!(cfg.block(0).instructions, vec![0, 3, 4]);
        assert!(cfg.block_at(5).is_none());
    }

    #[test]
    fn reachable_blocks_across_regions()
    {
        // 0: const/4 v0, 0 ; 1: if-eqz v0, +4 ; 3: throw v0 ; 4: return-void (dead)
        // 5: array-length v0, v0 ; 6: return-void ; 7: return-void
        // region 0..4 catches at 7, region 5..6 catches at 6
        let code = [0x0012, 0x0038, 0x0004, 0x0027, 0x000e, 0x0021, 0x000e, 0x000e];
        let insns = decode_method(&code, 1).unwrap();
        let mut table = ExceptionTable::default();
        table.add_region(0, 4, vec![CatchClause { catch_type: None, address: 7 }]);
        table.add_region(5, 6, vec![CatchClause { catch_type: None, address: 6 }]);
        let cfg = Cfg::from_parts(&insns, 1, table).unwrap();

        assert_eq!(cfg.block_count(), 5);
        assert!(cfg.block_at(4).is_none());
        assert_eq!(cfg.reverse_postorder().len(), cfg.block_count());
        for b in cfg.blocks().iter().skip(1) {
            assert!(!b.preds.is_empty() || !b.exception_preds.is_empty(), "block {} has no predecessor", b.id);
        }

        // the entry block sits in a try region but cannot throw
        assert!(cfg.block(0).handlers.is_empty());
        let at = |o: u32| cfg.block_at(o).unwrap();
        assert_eq!(cfg.block(at(3)).handlers, vec![at(7)]);
        assert_eq!(cfg.block(at(5)).handlers, vec![at(6)]);
        assert_eq!(cfg.block(at(5)).succs, vec![at(6)]);
        assert!(cfg.block(at(6)).is_handler && cfg.block(at(7)).is_handler);
        assert_eq!(cfg.block(at(7)).exception_preds, vec![at(3)]);
    }
}
