//! Try regions and their exception handlers.
//!
//! Handlers are shared method-wide by address. After collection, regions whose
//! handler sets contain another region's set give the shared handlers up, so
//! each handler ends up owned by the most specific region that lists it.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use rangemap::RangeMap;
use serde::Serialize;

use crate::dex::container::CodeItem;
use crate::dex::error::DexError;

pub type RegionId = usize;
pub type HandlerId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionHandler {
    pub id: HandlerId,
    /// Code-unit position of the handler entry.
    pub address: u32,
    /// Type indices caught at this address.
    pub catch_types: BTreeSet<u32>,
    pub catch_all: bool,
    pub owner: RegionId,
}

/// One clause as declared by a try item, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatchClause {
    /// `None` for the catch-all clause.
    pub catch_type: Option<u32>,
    pub address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TryRegion {
    pub id: RegionId,
    pub start: u32,
    /// Exclusive end.
    pub end: u32,
    pub handlers: Vec<HandlerId>,
    pub clauses: Vec<CatchClause>,
}

impl TryRegion {
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionTable {
    regions: Vec<TryRegion>,
    handlers: Vec<ExceptionHandler>,
    by_address: HashMap<u32, HandlerId>,
    coverage: RangeMap<u32, RegionId>,
}

impl ExceptionTable {
    /// Collects the regions of a code item and merges shared handlers.
    pub fn build(code: &CodeItem) -> Result<ExceptionTable, DexError> {
        let mut table = ExceptionTable::collect(code)?;
        if !table.is_empty() {
            table.merge();
        }
        Ok(table)
    }

    /// Collects regions without merging.
    pub fn collect(code: &CodeItem) -> Result<ExceptionTable, DexError> {
        let mut table = ExceptionTable::default();
        for item in &code.tries {
            let entry = code.catch_handler(item)?;
            let mut clauses: Vec<CatchClause> = entry
                .pairs
                .iter()
                .map(|p| CatchClause { catch_type: Some(p.type_idx), address: p.addr })
                .collect();
            if let Some(address) = entry.catch_all_addr {
                clauses.push(CatchClause { catch_type: None, address });
            }
            let start = item.start_addr;
            let end = start + item.insn_count as u32;
            table.add_region(start, end, clauses);
        }
        Ok(table)
    }

    /// Adds a region covering `start..end`. Returns its id.
    pub fn add_region(&mut self, start: u32, end: u32, clauses: Vec<CatchClause>) -> RegionId {
        let id = self.regions.len();
        let mut handlers = Vec::with_capacity(clauses.len());
        for clause in &clauses {
            let h = self.register_handler(id, clause.address, clause.catch_type);
            if !handlers.contains(&h) {
                handlers.push(h);
            }
        }
        if start < end {
            self.coverage.insert(start..end, id);
        }
        self.regions.push(TryRegion { id, start, end, handlers, clauses });
        id
    }

    /// Returns the handler at `address`, creating it on first sight. A repeat
    /// registration unions the catch types into the existing handler.
    fn register_handler(&mut self, region: RegionId, address: u32, catch_type: Option<u32>) -> HandlerId {
        let id = match self.by_address.get(&address) {
            Some(id) => *id,
            None => {
                let id = self.handlers.len();
                self.handlers.push(ExceptionHandler {
                    id,
                    address,
                    catch_types: BTreeSet::new(),
                    catch_all: false,
                    owner: region,
                });
                self.by_address.insert(address, id);
                id
            }
        };
        let handler = &mut self.handlers[id];
        match catch_type {
            Some(t) => {
                handler.catch_types.insert(t);
            }
            None => handler.catch_all = true,
        }
        id
    }

    /// Re-homes handlers shared between regions to the most specific region.
    /// Runs to a fixpoint; a second call changes nothing. Returns the number
    /// of handler references removed.
    pub fn merge(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let mut changed = false;
            for i in 0..self.regions.len() {
                for j in 0..self.regions.len() {
                    if i == j {
                        continue;
                    }
                    let sup: BTreeSet<HandlerId> = self.regions[i].handlers.iter().copied().collect();
                    let sub: BTreeSet<HandlerId> = self.regions[j].handlers.iter().copied().collect();
                    if sup.is_empty() || sub.is_empty() || !sub.is_subset(&sup) {
                        continue;
                    }
                    // equal sets stay with the lowest region id
                    if sup == sub && i < j {
                        continue;
                    }
                    self.regions[i].handlers.retain(|h| !sub.contains(h));
                    for h in &sub {
                        self.handlers[*h].owner = j;
                    }
                    removed += sub.len();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if removed > 0 {
            debug!("merged {} shared exception handler references", removed);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[TryRegion] {
        &self.regions
    }

    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    pub fn handler_at(&self, address: u32) -> Option<&ExceptionHandler> {
        self.by_address.get(&address).map(|id| &self.handlers[*id])
    }

    /// Total handler references held by all regions.
    pub fn handler_ref_count(&self) -> usize {
        self.regions.iter().map(|r| r.handlers.len()).sum()
    }

    pub fn region_at(&self, offset: u32) -> Option<&TryRegion> {
        self.coverage.get(&offset).map(|id| &self.regions[*id])
    }

    /// Every region boundary and handler address, in no particular order.
    pub fn boundaries(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions
            .iter()
            .flat_map(|r| [r.start, r.end])
            .chain(self.handlers.iter().map(|h| h.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO: u32 = 7;
    const BAR: u32 = 8;

    fn foo_at(address: u32) -> CatchClause {
        CatchClause { catch_type: Some(FOO), address }
    }

    #[test]
    fn shared_handler_is_deduplicated()
    {
        let mut table = ExceptionTable::default();
        table.add_region(0, 4, vec![foo_at(0x10)]);
        table.add_region(4, 8, vec![foo_at(0x10)]);
        assert_eq!(table.handlers().len(), 1);
        assert_eq!(table.handler_ref_count(), 2);

        table.merge();
        assert_eq!(table.handler_ref_count(), 1);
        assert_eq!(table.regions()[0].handlers, vec![0]);
        assert!(table.regions()[1].handlers.is_empty());
        assert_eq!(table.handler_at(0x10).unwrap().owner, 0);
    }

    #[test]
    fn subset_region_owns_shared_handlers()
    {
        let mut table = ExceptionTable::default();
        table.add_region(0, 10, vec![foo_at(0x20), CatchClause { catch_type: None, address: 0x30 }]);
        table.add_region(2, 4, vec![foo_at(0x20)]);
        table.merge();
        assert_eq!(table.regions()[0].handlers, vec![1]);
        assert_eq!(table.regions()[1].handlers, vec![0]);
        assert_eq!(table.handler_at(0x20).unwrap().owner, 1);
        assert!(table.handler_at(0x30).unwrap().catch_all);
        // clauses are untouched
        assert_eq!(table.regions()[0].clauses.len(), 2);
    }

    #[test]
    fn repeat_registration_unions_types()
    {
        let mut table = ExceptionTable::default();
        table.add_region(0, 2, vec![foo_at(0x10)]);
        table.add_region(2, 4, vec![CatchClause { catch_type: Some(BAR), address: 0x10 }]);
        let h = table.handler_at(0x10).unwrap();
        assert_eq!(h.catch_types, BTreeSet::from([FOO, BAR]));
        assert!(!h.catch_all);
    }

    #[test]
    fn merge_is_idempotent()
    {
        let mut table = ExceptionTable::default();
        table.add_region(0, 10, vec![foo_at(0x20), foo_at(0x22)]);
        table.add_region(2, 4, vec![foo_at(0x20)]);
        table.add_region(5, 6, vec![foo_at(0x20)]);
        table.merge();
        let regions = table.regions().to_vec();
        let owners: Vec<_> = table.handlers().iter().map(|h| h.owner).collect();
        assert_eq!(table.merge(), 0);
        assert_eq!(table.regions(), regions.as_slice());
        assert_eq!(owners, table.handlers().iter().map(|h| h.owner).collect::<Vec<_>>());
    }

    #[test]
    fn empty_table_and_coverage()
    {
        let table = ExceptionTable::default();
        assert!(table.is_empty());
        assert!(table.region_at(0).is_none());

        let mut table = ExceptionTable::default();
        table.add_region(2, 5, vec![foo_at(9)]);
        assert!(table.region_at(1).is_none());
        assert_eq!(table.region_at(2).unwrap().id, 0);
        assert_eq!(table.region_at(4).unwrap().id, 0);
        assert!(table.region_at(5).is_none());
        let mut b: Vec<u32> = table.boundaries().collect();
        b.sort();
        assert_eq!(b, vec![2, 5, 9]);
    }
}
