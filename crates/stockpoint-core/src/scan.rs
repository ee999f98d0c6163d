//! Decoded barcode input.
//!
//! Decoding is the scanner collaborator's job; by the time a code reaches
//! the ledger it is a plain string. Unreadable codes never get here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::OperationDraft;

/// Output of the decode capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DecodedScan {
    /// Decoded code, used as the SKU.
    pub code: String,
    /// Time of the scan on the device.
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

/// Whether the scanned goods enter or leave the shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ScanDirection {
    In,
    Out,
}

impl DecodedScan {
    pub fn new(code: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        DecodedScan {
            code: code.into(),
            timestamp,
        }
    }

    /// Builds a `scan_in` / `scan_out` draft for `quantity` units.
    ///
    /// Surrounding whitespace from the scanner is dropped; everything else
    /// is left to validation.
    pub fn into_draft(
        self,
        direction: ScanDirection,
        quantity: i64,
        actor: impl Into<String>,
    ) -> OperationDraft {
        let sku = self.code.trim().to_string();
        match direction {
            ScanDirection::In => OperationDraft::scan_in(sku, quantity, actor),
            ScanDirection::Out => OperationDraft::scan_out(sku, quantity, actor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    #[test]
    fn test_scan_out_draft() {
        let scan = DecodedScan::new(" 5449000000996\n", Utc::now());
        let draft = scan.into_draft(ScanDirection::Out, 2, "promoter-1");

        assert_eq!(draft.sku, "5449000000996");
        assert_eq!(draft.kind, OperationKind::ScanOut);
        assert_eq!(draft.delta, -2);
    }

    #[test]
    fn test_scan_in_draft() {
        let draft = DecodedScan::new("COKE-330", Utc::now()).into_draft(ScanDirection::In, 6, "p");
        assert_eq!(draft.kind, OperationKind::ScanIn);
        assert_eq!(draft.delta, 6);
    }
}
