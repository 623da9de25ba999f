//! Per-tenant vendor classifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Needs,
    Wants,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Needs => "NEEDS",
            Classification::Wants => "WANTS",
        }
    }
}

impl core::fmt::Display for Classification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Classification {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEEDS" => Ok(Classification::Needs),
            "WANTS" => Ok(Classification::Wants),
            _ => Err(DomainError::validation(
                "classification must be NEEDS or WANTS",
            )),
        }
    }
}

/// Normalize a vendor name the way tags are keyed: trimmed, upper-case.
pub fn normalize_vendor(raw: &str) -> DomainResult<String> {
    let vendor = raw.trim().to_uppercase();
    if vendor.is_empty() {
        return Err(DomainError::validation("vendor is required"));
    }
    Ok(vendor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorTag {
    pub vendor: String,
    pub classification: Classification,
    pub last_updated: DateTime<Utc>,
}
