//! Unwind rows as delivered by the binary analysis step.
//!
//! The analyzer emits rows in a compact columnar form: start addresses are
//! delta-encoded against the end of the previous row, and the CFA/RBP rules
//! are indices into shared per-table dictionaries (most binaries use a
//! handful of distinct rules across hundreds of thousands of rows). The
//! table must be integrated into absolute, strictly increasing addresses
//! before it can be paged.

use std::collections::HashMap;

use thiserror::Error;

/// How to compute the canonical frame address for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfaRule {
    /// Not expressible as register plus offset; frames in this range are
    /// not unwindable.
    Unsupported,
    RegisterOffset { regno: u8, offset: i32 },
}

/// How to recover the caller's RBP for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RbpRule {
    /// The frame does not save RBP.
    Undefined,
    /// Saved RBP lives at CFA plus this offset.
    CfaPlusOffset { offset: i32 },
}

/// One fully decoded row: unwind rules for `[start_pc, start_pc + pc_range)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRow {
    pub start_pc: u64,
    pub pc_range: u32,
    pub cfa: CfaRule,
    pub rbp: RbpRule,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("row columns have mismatched lengths")]
    ColumnMismatch,
    #[error("row {row} references rule {index} outside the dictionary")]
    BadRuleIndex { row: usize, index: u32 },
    #[error("start addresses are not strictly increasing at row {row}")]
    NotMonotonic { row: usize },
}

/// One binary's unwind rows, integrated to absolute addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindTable {
    start_pc: Vec<u64>,
    pc_range: Vec<u32>,
    cfa_rule: Vec<u32>,
    rbp_rule: Vec<u32>,
    cfa_dict: Vec<CfaRule>,
    rbp_dict: Vec<RbpRule>,
}

impl UnwindTable {
    /// Decode a delta-encoded table: each stored start address is relative
    /// to the end (`start + range`) of the previous row.
    pub fn from_delta_encoded(
        mut start_pc: Vec<u64>,
        pc_range: Vec<u32>,
        cfa_rule: Vec<u32>,
        rbp_rule: Vec<u32>,
        cfa_dict: Vec<CfaRule>,
        rbp_dict: Vec<RbpRule>,
    ) -> Result<Self, SourceError> {
        if start_pc.len() != pc_range.len()
            || start_pc.len() != cfa_rule.len()
            || start_pc.len() != rbp_rule.len()
        {
            return Err(SourceError::ColumnMismatch);
        }

        for (row, &index) in cfa_rule.iter().enumerate() {
            if index as usize >= cfa_dict.len() {
                return Err(SourceError::BadRuleIndex { row, index });
            }
        }
        for (row, &index) in rbp_rule.iter().enumerate() {
            if index as usize >= rbp_dict.len() {
                return Err(SourceError::BadRuleIndex { row, index });
            }
        }

        let mut end: u64 = 0;
        for row in 0..start_pc.len() {
            start_pc[row] = start_pc[row].wrapping_add(end);
            if row > 0 && start_pc[row] <= start_pc[row - 1] {
                return Err(SourceError::NotMonotonic { row });
            }
            end = start_pc[row] + u64::from(pc_range[row]);
        }

        Ok(UnwindTable {
            start_pc,
            pc_range,
            cfa_rule,
            rbp_rule,
            cfa_dict,
            rbp_dict,
        })
    }

    /// Build a table from absolute rows, deduplicating rules into the
    /// dictionaries.
    pub fn from_rows(rows: &[UnwindRow]) -> Result<Self, SourceError> {
        let mut cfa_dict = Vec::new();
        let mut rbp_dict = Vec::new();
        let mut cfa_ids: HashMap<CfaRule, u32> = HashMap::new();
        let mut rbp_ids: HashMap<RbpRule, u32> = HashMap::new();

        let mut table = UnwindTable {
            start_pc: Vec::with_capacity(rows.len()),
            pc_range: Vec::with_capacity(rows.len()),
            cfa_rule: Vec::with_capacity(rows.len()),
            rbp_rule: Vec::with_capacity(rows.len()),
            cfa_dict: Vec::new(),
            rbp_dict: Vec::new(),
        };

        for (index, row) in rows.iter().enumerate() {
            if index > 0 && row.start_pc <= rows[index - 1].start_pc {
                return Err(SourceError::NotMonotonic { row: index });
            }
            let cfa = *cfa_ids.entry(row.cfa).or_insert_with(|| {
                cfa_dict.push(row.cfa);
                cfa_dict.len() as u32 - 1
            });
            let rbp = *rbp_ids.entry(row.rbp).or_insert_with(|| {
                rbp_dict.push(row.rbp);
                rbp_dict.len() as u32 - 1
            });
            table.start_pc.push(row.start_pc);
            table.pc_range.push(row.pc_range);
            table.cfa_rule.push(cfa);
            table.rbp_rule.push(rbp);
        }

        table.cfa_dict = cfa_dict;
        table.rbp_dict = rbp_dict;
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.start_pc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start_pc.is_empty()
    }

    pub fn row(&self, index: usize) -> UnwindRow {
        UnwindRow {
            start_pc: self.start_pc[index],
            pc_range: self.pc_range[index],
            cfa: self.cfa_dict[self.cfa_rule[index] as usize],
            rbp: self.rbp_dict[self.rbp_rule[index] as usize],
        }
    }
}
