//! Register categories and the transitions allowed between them

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Functional category of one memory-mapped register, as inferred by
/// the emulator and refined by the extraction loop.
///
/// The wire format is the emulator's integer code: 0 uncategorized,
/// 1 control, 2 status, 3 data, 4 combined control/status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Category {
    Uncategorized,
    Control,
    Status,
    Data,
    ControlStatus,
}

impl TryFrom<u8> for Category {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(Category::Uncategorized),
            1 => Ok(Category::Control),
            2 => Ok(Category::Status),
            3 => Ok(Category::Data),
            4 => Ok(Category::ControlStatus),
            _ => Err(format!("unknown register category code {}", code)),
        }
    }
}

impl From<Category> for u8 {
    fn from(cat: Category) -> u8 {
        match cat {
            Category::Uncategorized => 0,
            Category::Control => 1,
            Category::Status => 2,
            Category::Data => 3,
            Category::ControlStatus => 4,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Uncategorized => "uncategorized",
            Category::Control => "CR",
            Category::Status => "SR",
            Category::Data => "DR",
            Category::ControlStatus => "CR_SR",
        };
        write!(f, "{}", s)
    }
}

impl Category {
    /// Whether this register's value participates in the configuration
    /// signature of its peripheral.
    pub fn is_control(self) -> bool {
        matches!(self, Category::Control | Category::ControlStatus)
    }

    pub fn is_status(self) -> bool {
        matches!(self, Category::Status | Category::ControlStatus)
    }

    /// The partial order of permitted category transitions.
    ///
    /// Uncategorized may become anything; a control register may be
    /// found to also act as status; a status register that is never
    /// checked may be demoted to data (the caller additionally checks
    /// the lock flag). Everything else, in particular falling back to
    /// uncategorized, is forbidden.
    pub fn can_become(self, new: Category) -> bool {
        if self == new {
            return true;
        }
        match (self, new) {
            (Category::Uncategorized, _) => true,
            (Category::Control, Category::ControlStatus) => true,
            (Category::Status, Category::Data) => true,
            _ => false,
        }
    }
}

pub const ALL_CATEGORIES: [Category; 5] = [
    Category::Uncategorized,
    Category::Control,
    Category::Status,
    Category::Data,
    Category::ControlStatus,
];
