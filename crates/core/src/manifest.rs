//! Manifest and asset types.
//!
//! A manifest is the authoritative inventory of a completed job's artifacts.
//! It is written to storage after every asset it lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TenantId};

/// Reserved logical name of the manifest inside a job prefix.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Storage prefix shared by every blob of a job.
pub fn job_prefix(tenant_id: &TenantId, job_id: &JobId) -> String {
    format!("{tenant_id}/{job_id}")
}

/// Backend key of a logical asset name.
pub fn backend_key(tenant_id: &TenantId, job_id: &JobId, logical_name: &str) -> String {
    format!("{}/{logical_name}", job_prefix(tenant_id, job_id))
}

/// Validate a logical asset name.
///
/// Names are `/`-separated segments of `[A-Za-z0-9._-]`; `.`/`..` segments and
/// the manifest's own name are rejected.
pub fn validate_asset_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::validation("asset name is required"));
    }
    if name == MANIFEST_NAME {
        return Err(DomainError::validation(format!("{MANIFEST_NAME} is reserved")));
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(DomainError::validation(format!("invalid asset name: {name}")));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(DomainError::validation(format!("invalid asset name: {name}")));
        }
    }
    Ok(())
}

/// A single artifact produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub logical_name: String,
    pub backend_key: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub assets: Vec<Asset>,
}

impl Manifest {
    /// Build a manifest; assets are sorted by logical name and names must be unique.
    pub fn new(
        tenant_id: TenantId,
        job_id: JobId,
        created_at: DateTime<Utc>,
        mut assets: Vec<Asset>,
    ) -> DomainResult<Self> {
        assets.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        if let Some(dup) = assets
            .windows(2)
            .find(|pair| pair[0].logical_name == pair[1].logical_name)
        {
            return Err(DomainError::validation(format!(
                "duplicate asset name: {}",
                dup[0].logical_name
            )));
        }
        Ok(Self {
            job_id,
            tenant_id,
            created_at,
            assets,
        })
    }

    pub fn find(&self, logical_name: &str) -> Option<&Asset> {
        self.assets
            .binary_search_by(|a| a.logical_name.as_str().cmp(logical_name))
            .ok()
            .map(|idx| &self.assets[idx])
    }

    pub fn total_bytes(&self) -> u64 {
        self.assets.iter().map(|a| a.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str, size: u64) -> Asset {
        Asset {
            logical_name: name.to_string(),
            backend_key: format!("t/j/{name}"),
            content_type: "text/csv".to_string(),
            size_bytes: size,
        }
    }

    #[test]
    fn asset_names_are_validated() {
        for ok in ["report.csv", "charts/spend-by-vendor.png", "a_b.v2.json"] {
            validate_asset_name(ok).unwrap();
        }
        for bad in ["", "manifest.json", "../x", "a//b", "/abs", "a/./b", "sp ace.csv", "a\\b"] {
            assert!(validate_asset_name(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn manifest_sorts_assets_and_sums_sizes() {
        let tenant = TenantId::parse("t").unwrap();
        let job = JobId::new();
        let manifest = Manifest::new(
            tenant.clone(),
            job,
            Utc::now(),
            vec![asset("z.csv", 10), asset("a.png", 5)],
        )
        .unwrap();

        assert_eq!(manifest.assets[0].logical_name, "a.png");
        assert_eq!(manifest.total_bytes(), 15);
        assert_eq!(manifest.find("z.csv").map(|a| a.size_bytes), Some(10));
        assert!(manifest.find("missing").is_none());

        assert_eq!(backend_key(&tenant, &job, "a.png"), format!("t/{job}/a.png"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Manifest::new(
            TenantId::parse("t").unwrap(),
            JobId::new(),
            Utc::now(),
            vec![asset("a.csv", 1), asset("a.csv", 2)],
        );
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }
}
