use std::sync::Arc;

use thiserror::Error;

use conductor_core::TenantId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantSourceError {
    #[error("tenant source unavailable: {0}")]
    Unavailable(String),
}

/// One page of active tenants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantPage {
    pub tenants: Vec<TenantId>,
    /// Offset of the next page, `None` on the last page.
    pub next_offset: Option<usize>,
}

/// Read-only, paginated enumeration of active tenants.
pub trait TenantSource: Send + Sync {
    fn page(&self, offset: usize, limit: usize) -> Result<TenantPage, TenantSourceError>;
}

impl<S> TenantSource for Arc<S>
where
    S: TenantSource + ?Sized,
{
    fn page(&self, offset: usize, limit: usize) -> Result<TenantPage, TenantSourceError> {
        (**self).page(offset, limit)
    }
}

/// Collect up to `cap` tenants, `page_size` at a time.
pub fn collect_tenants<S: TenantSource + ?Sized>(
    source: &S,
    page_size: usize,
    cap: usize,
) -> Result<Vec<TenantId>, TenantSourceError> {
    let page_size = page_size.max(1);
    let mut tenants = Vec::new();
    let mut offset = Some(0);

    while let Some(current) = offset {
        if tenants.len() >= cap {
            break;
        }
        let limit = page_size.min(cap - tenants.len());
        let page = source.page(current, limit)?;
        if page.tenants.is_empty() {
            break;
        }
        tenants.extend(page.tenants);
        offset = page.next_offset;
    }

    tenants.truncate(cap);
    Ok(tenants)
}

/// Fixed tenant list (tests/dev).
#[derive(Debug, Clone, Default)]
pub struct StaticTenantSource {
    tenants: Vec<TenantId>,
}

impl StaticTenantSource {
    pub fn new(tenants: Vec<TenantId>) -> Self {
        Self { tenants }
    }
}

impl TenantSource for StaticTenantSource {
    fn page(&self, offset: usize, limit: usize) -> Result<TenantPage, TenantSourceError> {
        let tenants: Vec<_> = self.tenants.iter().skip(offset).take(limit).copied().collect();
        let end = offset + tenants.len();
        Ok(TenantPage {
            next_offset: (end < self.tenants.len()).then_some(end),
            tenants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_page() {
        let all: Vec<_> = (0..7).map(|_| TenantId::new()).collect();
        let source = StaticTenantSource::new(all.clone());
        assert_eq!(collect_tenants(&source, 3, 100).unwrap(), all);
    }

    #[test]
    fn stops_at_cap() {
        let all: Vec<_> = (0..10).map(|_| TenantId::new()).collect();
        let source = StaticTenantSource::new(all.clone());
        assert_eq!(collect_tenants(&source, 4, 6).unwrap(), all[..6].to_vec());
    }

    #[test]
    fn empty_source_yields_no_tenants() {
        let source = StaticTenantSource::default();
        assert!(collect_tenants(&source, 10, 10).unwrap().is_empty());
    }
}
