/// Namespace lookaside buffer.
///
/// Instructions name a logical namespace rather than a PE. The table is built
/// once when the controller attaches to the fabric:
///   namespace 0     → the local PE
///   namespace i + 1 → the i-th host reported by the transport
/// and is read-only afterwards.
use crate::error::{Result, RmcError};
use crate::PeId;

pub const LOCAL_NAMESPACE: u64 = 0;

#[derive(Debug, Clone)]
pub struct NamespaceRouter {
    entries: Vec<(u64, PeId)>,
    capacity: usize,
}

impl NamespaceRouter {
    pub fn new(capacity: usize) -> Self {
        NamespaceRouter {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Build the table from the local id and the fabric's host list.
    pub fn from_hosts(local: PeId, hosts: &[PeId], capacity: usize) -> Result<Self> {
        let mut router = Self::new(capacity);
        router.insert(LOCAL_NAMESPACE, local)?;
        for (i, &host) in hosts.iter().enumerate() {
            router.insert(i as u64 + 1, host)?;
        }
        log::debug!(
            "PE {}: namespace table holds {} entries",
            local,
            router.entries.len()
        );
        Ok(router)
    }

    pub fn insert(&mut self, nmspace: u64, dest: PeId) -> Result<()> {
        if self.entries.iter().any(|&(ns, _)| ns == nmspace) {
            return Err(RmcError::DuplicateNamespace(nmspace));
        }
        if self.entries.len() >= self.capacity {
            return Err(RmcError::NamespaceTableFull { capacity: self.capacity });
        }
        self.entries.push((nmspace, dest));
        Ok(())
    }

    pub fn resolve(&self, nmspace: u64) -> Result<PeId> {
        self.entries
            .iter()
            .find(|&&(ns, _)| ns == nmspace)
            .map(|&(_, dest)| dest)
            .ok_or(RmcError::UnknownNamespace(nmspace))
    }

}
