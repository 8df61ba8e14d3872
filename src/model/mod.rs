//! Peripheral model document structures

mod category;
mod document;
mod prereq;

pub use category::{Category, ALL_CATEGORIES};
pub use document::{EventTable, ModelDoc, Peripheral, Register, SrRead};
pub use prereq::{BitConstraint, BitState, ConstraintTuple, PrereqRecord};
