//! Backwards liveness analysis over the register file.

use std::collections::HashSet;

use log::debug;

use crate::analysis::bitset::BitSet;
use crate::analysis::cfg::{BlockId, Cfg};
use crate::dex::error::DexError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessInfo {
    pub register_count: usize,
    pub use_sets: Vec<BitSet>,
    pub def_sets: Vec<BitSet>,
    pub live_in: Vec<BitSet>,
    pub live_out: Vec<BitSet>,
    /// Full passes the fixed point took.
    pub passes: usize,
    last_uses: HashSet<(u32, u16)>,
}

impl LivenessInfo {
    /// True when `reg` is read by the instruction at `offset` and dead after it.
    pub fn is_last_use(&self, offset: u32, reg: u16) -> bool {
        self.last_uses.contains(&(offset, reg))
    }
}

/// Per-block upward-exposed uses and definitions.
pub fn compute_use_def(cfg: &Cfg) -> (Vec<BitSet>, Vec<BitSet>) {
    let reg_count = cfg.register_count() as usize;
    let mut use_sets = Vec::with_capacity(cfg.block_count());
    let mut def_sets = Vec::with_capacity(cfg.block_count());

    for b in cfg.blocks() {
        let mut use_set = BitSet::new_empty(reg_count);
        let mut def_set = BitSet::new_empty(reg_count);
        for insn in cfg.instructions(b.id) {
            let roles = insn.roles();
            for r in roles.uses {
                let r = r as usize;
                if !def_set.get(r) {
                    use_set.set(r);
                }
            }
            for w in roles.defs {
                let w = w as usize;
                if !use_set.get(w) {
                    def_set.set(w);
                }
            }
        }
        use_sets.push(use_set);
        def_sets.push(def_set);
    }

    (use_sets, def_sets)
}

/// Solves `in = use ∪ (out \ def)`, `out = ∪ in(succ)` to a fixed point.
///
/// Only blocks listed in `order` are revisited; any other block keeps an empty
/// live-out. Returns live-in, live-out and the number of full passes.
pub fn solve(
    reg_count: usize,
    use_sets: &[BitSet],
    def_sets: &[BitSet],
    successors: &[Vec<BlockId>],
    order: &[BlockId],
) -> Result<(Vec<BitSet>, Vec<BitSet>, usize), DexError> {
    let n = use_sets.len();
    let mut live_in: Vec<BitSet> = use_sets.to_vec();
    let mut live_out: Vec<BitSet> = (0..n).map(|_| BitSet::new_empty(reg_count)).collect();
    let limit = reg_count * n + 2;

    let mut passes = 0;
    loop {
        passes += 1;
        if passes > limit {
            fail!(kind = Structural, "liveness did not converge after {} passes", limit);
        }
        let mut changed = false;
        for &b in order {
            let mut out = BitSet::new_empty(reg_count);
            for s in &successors[b] {
                out.union_with(&live_in[*s]);
            }

            let mut in_set = out.clone();
            in_set.subtract_with(&def_sets[b]);
            in_set.union_with(&use_sets[b]);

            live_out[b] = out;
            if in_set != live_in[b] {
                live_in[b] = in_set;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Ok((live_in, live_out, passes))
}

/// Runs use/def collection and the liveness fixed point over a method.
pub fn analyze(cfg: &Cfg) -> Result<LivenessInfo, DexError> {
    let reg_count = cfg.register_count() as usize;
    let (use_sets, def_sets) = compute_use_def(cfg);

    let successors: Vec<Vec<BlockId>> = cfg.blocks().iter().map(|b| b.all_successors().collect()).collect();

    // exits keep an empty live-out; the rest are visited latest block first
    let mut order = Vec::with_capacity(cfg.block_count());
    for b in cfg.blocks() {
        if !successors[b.id].is_empty() {
            order.push((b.first_offset()?, b.id));
        }
    }
    order.sort_by(|a, b| b.0.cmp(&a.0));
    let order: Vec<BlockId> = order.into_iter().map(|(_, id)| id).collect();

    let (live_in, live_out, passes) = solve(reg_count, &use_sets, &def_sets, &successors, &order)?;
    debug!("liveness: {} blocks, {} registers, {} passes", cfg.block_count(), reg_count, passes);

    let mut last_uses = HashSet::new();
    for b in cfg.blocks() {
        // a handler may observe any register live at its entry from anywhere in the block
        let mut handler_live = BitSet::new_empty(reg_count);
        for h in &b.handlers {
            handler_live.union_with(&live_in[*h]);
        }
        let mut live = live_out[b.id].clone();
        let insns: Vec<_> = cfg.instructions(b.id).collect();
        for insn in insns.iter().rev() {
            live.union_with(&handler_live);
            let roles = insn.roles();
            for r in &roles.uses {
                if !live.get(*r as usize) {
                    last_uses.insert((insn.offset, *r));
                }
            }
            for d in &roles.defs {
                live.clear(*d as usize);
            }
            for r in &roles.uses {
                live.set(*r as usize);
            }
        }
    }

    Ok(LivenessInfo { register_count: reg_count, use_sets, def_sets, live_in, live_out, passes, last_uses })
}
