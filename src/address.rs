/// Range Addresses
///
/// Grid ranges are written the spreadsheet way: `A1`, `B7:C5`,
/// `Sheet4!Q4:Z10`. Without a sheet name the address refers to whichever
/// sheet the surface considers active.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAddress {
    sheet: Option<String>,
    start: String,
    end: Option<String>,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(.*?)!)?([A-Z]+[0-9]+)(?::([A-Z]+[0-9]+))?$").expect("static pattern is valid")
    })
}

impl RangeAddress {
    pub fn parse(expression: &str) -> Result<Self> {
        let captures = pattern()
            .captures(expression)
            .ok_or_else(|| Error::InvalidAddress(expression.to_string()))?;

        let sheet = captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty());
        let start = captures[2].to_string();
        let end = captures.get(3).map(|m| m.as_str().to_string());

        for cell in std::iter::once(&start).chain(end.iter()) {
            cell_position(cell).ok_or_else(|| Error::InvalidAddress(expression.to_string()))?;
        }

        Ok(RangeAddress { sheet, start, end })
    }

    pub fn sheet(&self) -> Option<&str> {
        self.sheet.as_deref()
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> Option<&str> {
        self.end.as_deref()
    }

    /// Zero-based (row, column) of the start cell
    pub fn anchor(&self) -> (usize, usize) {
        // Validated in parse
        cell_position(&self.start).unwrap_or((0, 0))
    }
}

/// Zero-based (row, column) of a cell like `AB12`; None for row 0.
fn cell_position(cell: &str) -> Option<(usize, usize)> {
    let split = cell.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cell.split_at(split);

    let column = letters
        .bytes()
        .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add((b - b'A') as usize + 1))?;
    let row: usize = digits.parse().ok()?;
    if row == 0 || column == 0 {
        return None;
    }
    Some((row - 1, column - 1))
}

impl fmt::Display for RangeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            write!(f, "{}!", sheet)?;
        }
        f.write_str(&self.start)?;
        if let Some(end) = &self.end {
            write!(f, ":{}", end)?;
        }
        Ok(())
    }
}
