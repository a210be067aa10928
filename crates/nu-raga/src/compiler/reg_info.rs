//! Register model: hard registers, register classes and the tables the
//! allocator derives from them.
//!
//! Classes may overlap and registers may alias one another (a byte
//! sub-register aliases the word register containing it). Two derived tables
//! let the allocator reason about unequal classes:
//!
//! - `displacement[i][j]`: the worst-case number of members of class `i`
//!   that one neighbor of class `j` can block.
//! - `aliases_in_class[r][c]`: the members of class `c` that register `r`
//!   overlaps.
//!
//! A built model is immutable and can be shared by any number of allocator
//! instances.

use std::collections::HashMap;
use std::fmt;

use super::RegAllocError;

/// Maximum number of hard registers a model can describe
pub const MAX_REGS: usize = 128;

/// Physical register number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardReg(pub u16);

impl HardReg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HardReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%r{}", self.0)
    }
}

/// Register class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegClassId(pub u16);

impl RegClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense set of hard registers
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u128);

impl RegSet {
    pub const fn empty() -> Self {
        RegSet(0)
    }

    pub fn insert(&mut self, reg: HardReg) {
        self.0 |= 1u128 << reg.0;
    }

    pub fn remove(&mut self, reg: HardReg) {
        self.0 &= !(1u128 << reg.0);
    }

    pub fn contains(&self, reg: HardReg) -> bool {
        reg.index() < MAX_REGS && self.0 & (1u128 << reg.0) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: RegSet) -> RegSet {
        RegSet(self.0 | other.0)
    }

    pub fn intersection(self, other: RegSet) -> RegSet {
        RegSet(self.0 & other.0)
    }

    pub fn difference(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    pub fn is_superset(&self, other: &RegSet) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn first(&self) -> Option<HardReg> {
        if self.0 == 0 {
            None
        } else {
            Some(HardReg(self.0.trailing_zeros() as u16))
        }
    }

    /// Members in ascending order
    pub fn iter(&self) -> impl Iterator<Item = HardReg> {
        let bits = self.0;
        (0..MAX_REGS as u16)
            .filter(move |i| bits & (1u128 << i) != 0)
            .map(HardReg)
    }
}

impl FromIterator<HardReg> for RegSet {
    fn from_iter<I: IntoIterator<Item = HardReg>>(iter: I) -> Self {
        let mut set = RegSet::empty();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone)]
struct RegClass {
    name: String,
    members: RegSet,
}

/// Builder for a [`RegisterModel`]
#[derive(Debug, Default)]
pub struct RegisterModelBuilder {
    names: Vec<String>,
    alias_pairs: Vec<(HardReg, HardReg)>,
    classes: Vec<RegClass>,
    caller_saved: RegSet,
    callee_saved: RegSet,
}

impl RegisterModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a hard register
    pub fn register(&mut self, name: impl Into<String>) -> HardReg {
        let reg = HardReg(self.names.len() as u16);
        self.names.push(name.into());
        reg
    }

    /// Declare that `a` and `b` overlap (share storage)
    pub fn alias(&mut self, a: HardReg, b: HardReg) -> &mut Self {
        self.alias_pairs.push((a, b));
        self
    }

    pub fn class(&mut self, name: impl Into<String>, regs: &[HardReg]) -> RegClassId {
        let id = RegClassId(self.classes.len() as u16);
        self.classes.push(RegClass {
            name: name.into(),
            members: regs.iter().copied().collect(),
        });
        id
    }

    pub fn caller_saved(&mut self, regs: &[HardReg]) -> &mut Self {
        self.caller_saved = self.caller_saved.union(regs.iter().copied().collect());
        self
    }

    pub fn callee_saved(&mut self, regs: &[HardReg]) -> &mut Self {
        self.callee_saved = self.callee_saved.union(regs.iter().copied().collect());
        self
    }

    pub fn build(&self) -> Result<RegisterModel, RegAllocError> {
        let reg_count = self.names.len();
        if reg_count > MAX_REGS {
            return Err(RegAllocError::InvalidRegisterModel(format!(
                "{} registers declared, at most {} supported",
                reg_count, MAX_REGS
            )));
        }

        let mut aliases: Vec<RegSet> = (0..reg_count)
            .map(|i| std::iter::once(HardReg(i as u16)).collect())
            .collect();
        for &(a, b) in &self.alias_pairs {
            if a.index() >= reg_count || b.index() >= reg_count {
                return Err(RegAllocError::InvalidRegisterModel(format!(
                    "alias between undeclared registers {} and {}",
                    a, b
                )));
            }
            aliases[a.index()].insert(b);
            aliases[b.index()].insert(a);
        }

        let allocatable = self.caller_saved.union(self.callee_saved);
        if allocatable.is_empty() {
            return Err(RegAllocError::InvalidRegisterModel(
                "no allocatable registers".into(),
            ));
        }
        if !self.caller_saved.intersection(self.callee_saved).is_empty() {
            return Err(RegAllocError::InvalidRegisterModel(
                "a register cannot be both caller- and callee-saved".into(),
            ));
        }
        if allocatable.iter().any(|r| r.index() >= reg_count) {
            return Err(RegAllocError::InvalidRegisterModel(
                "save pool names an undeclared register".into(),
            ));
        }

        let mut classes: Vec<RegClass> = Vec::new();
        let mut by_members: HashMap<RegSet, RegClassId> = HashMap::new();
        let mut add_class = |class: RegClass, classes: &mut Vec<RegClass>| {
            *by_members.entry(class.members).or_insert_with(|| {
                let id = RegClassId(classes.len() as u16);
                classes.push(class);
                id
            })
        };

        for class in &self.classes {
            if class.members.is_empty() {
                return Err(RegAllocError::InvalidRegisterModel(format!(
                    "register class '{}' is empty",
                    class.name
                )));
            }
            if !allocatable.is_superset(&class.members) {
                return Err(RegAllocError::InvalidRegisterModel(format!(
                    "register class '{}' has non-allocatable members",
                    class.name
                )));
            }
            add_class(class.clone(), &mut classes);
        }
        let any = add_class(
            RegClass {
                name: "any".into(),
                members: allocatable,
            },
            &mut classes,
        );

        let mut singletons = vec![None; reg_count];
        for reg in allocatable.iter() {
            let id = add_class(
                RegClass {
                    name: self.names[reg.index()].clone(),
                    members: std::iter::once(reg).collect(),
                },
                &mut classes,
            );
            singletons[reg.index()] = Some(id);
        }

        // Close the class set under intersection
        let mut changed = true;
        while changed {
            changed = false;
            let count = classes.len();
            for i in 0..count {
                for j in (i + 1)..count {
                    let members = classes[i].members.intersection(classes[j].members);
                    if members.is_empty() || by_members_contains(&classes, members) {
                        continue;
                    }
                    let name = format!("{}&{}", classes[i].name, classes[j].name);
                    add_class(RegClass { name, members }, &mut classes);
                    changed = true;
                }
            }
        }

        let class_count = classes.len();
        let lookup: HashMap<RegSet, RegClassId> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.members, RegClassId(i as u16)))
            .collect();

        let intersections = (0..class_count)
            .map(|i| {
                (0..class_count)
                    .map(|j| {
                        let members = classes[i].members.intersection(classes[j].members);
                        lookup.get(&members).copied()
                    })
                    .collect()
            })
            .collect();

        let displacements = (0..class_count)
            .map(|i| {
                (0..class_count)
                    .map(|j| {
                        classes[j]
                            .members
                            .iter()
                            .map(|r| classes[i].members.intersection(aliases[r.index()]).len())
                            .max()
                            .unwrap_or(0) as i32
                    })
                    .collect()
            })
            .collect();

        let aliases_in_class = (0..reg_count)
            .map(|r| {
                classes
                    .iter()
                    .map(|c| aliases[r].intersection(c.members))
                    .collect()
            })
            .collect();

        Ok(RegisterModel {
            names: self.names.clone(),
            aliases,
            classes,
            allocatable,
            caller_saved: self.caller_saved,
            callee_saved: self.callee_saved,
            intersections,
            displacements,
            aliases_in_class,
            singletons,
            any,
        })
    }
}

fn by_members_contains(classes: &[RegClass], members: RegSet) -> bool {
    classes.iter().any(|c| c.members == members)
}

/// Immutable description of a target's registers
#[derive(Debug, Clone)]
pub struct RegisterModel {
    names: Vec<String>,
    aliases: Vec<RegSet>,
    classes: Vec<RegClass>,
    allocatable: RegSet,
    caller_saved: RegSet,
    callee_saved: RegSet,
    intersections: Vec<Vec<Option<RegClassId>>>,
    displacements: Vec<Vec<i32>>,
    aliases_in_class: Vec<Vec<RegSet>>,
    singletons: Vec<Option<RegClassId>>,
    any: RegClassId,
}

impl RegisterModel {
    pub fn builder() -> RegisterModelBuilder {
        RegisterModelBuilder::new()
    }

    pub fn reg_count(&self) -> usize {
        self.names.len()
    }

    pub fn reg_name(&self, reg: HardReg) -> &str {
        self.names.get(reg.index()).map_or("?", String::as_str)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn class_name(&self, class: RegClassId) -> &str {
        &self.classes[class.index()].name
    }

    pub fn class_by_name(&self, name: &str) -> Option<RegClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| RegClassId(i as u16))
    }

    pub fn members(&self, class: RegClassId) -> RegSet {
        self.classes[class.index()].members
    }

    pub fn class_size(&self, class: RegClassId) -> usize {
        self.classes[class.index()].members.len()
    }

    /// The class of every allocatable register
    pub fn any_class(&self) -> RegClassId {
        self.any
    }

    /// The one-member class of an allocatable register
    pub fn singleton(&self, reg: HardReg) -> Option<RegClassId> {
        self.singletons.get(reg.index()).copied().flatten()
    }

    /// Class whose members are those common to `a` and `b`, if non-empty
    pub fn intersect(&self, a: RegClassId, b: RegClassId) -> Option<RegClassId> {
        if a == b {
            return Some(a);
        }
        self.intersections[a.index()][b.index()]
    }

    /// Worst-case number of members of `a` blocked by one neighbor of class `b`
    pub fn displacement(&self, a: RegClassId, b: RegClassId) -> i32 {
        self.displacements[a.index()][b.index()]
    }

    /// Registers overlapping `reg`, including `reg` itself
    pub fn aliases(&self, reg: HardReg) -> RegSet {
        self.aliases[reg.index()]
    }

    /// Members of `class` that overlap `reg`
    pub fn aliases_in_class(&self, reg: HardReg, class: RegClassId) -> RegSet {
        self.aliases_in_class[reg.index()][class.index()]
    }

    pub fn allocatable(&self) -> RegSet {
        self.allocatable
    }

    pub fn is_allocatable(&self, reg: HardReg) -> bool {
        self.allocatable.contains(reg)
    }

    pub fn caller_saved(&self) -> RegSet {
        self.caller_saved
    }

    pub fn callee_saved(&self) -> RegSet {
        self.callee_saved
    }

    /// Choose a member of `class` drawn from `pool` and not in `excluded`.
    ///
    /// Without a cursor the lowest-numbered candidate wins. With one, the
    /// search starts at the cursor and wraps, and the cursor advances past
    /// the choice so successive calls rotate through the pool.
    pub fn choose(
        &self,
        class: RegClassId,
        pool: RegSet,
        excluded: RegSet,
        cursor: Option<&mut usize>,
    ) -> Option<HardReg> {
        let candidates = self.members(class).intersection(pool).difference(excluded);
        match cursor {
            None => candidates.first(),
            Some(cursor) => {
                let choice = candidates
                    .iter()
                    .find(|r| r.index() >= *cursor)
                    .or_else(|| candidates.first())?;
                *cursor = choice.index() + 1;
                Some(choice)
            }
        }
    }
}
