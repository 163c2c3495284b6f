//! Debug bookkeeping of live allocations.

use std::backtrace::Backtrace;
use std::sync::Arc;
use derive_more::{Display, Error};
use parking_lot::Mutex;
use zenith_core::collections::hashmap::{Entry, HashMap};
use zenith_core::log;
use crate::memory::GpuAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocationTrackingMode {
    /// Address and sizes only.
    #[default]
    Basic,
    /// Additionally captures a stack trace per allocation.
    Full,
}

#[derive(Clone, Debug)]
pub struct AllocationRecord {
    pub address: GpuAddress,
    pub requested_size: u64,
    pub allocated_size: u64,
    pub alignment: u64,
    pub stack_trace: Option<Arc<Backtrace>>,
}

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRecordError {
    #[display("address {_0:#x} is already recorded")]
    DuplicateAddress(#[error(not(source))] GpuAddress),
    #[display("no allocation record for address {_0:#x}")]
    MissingRecord(#[error(not(source))] GpuAddress),
}

/// Set of live allocations keyed by address.
///
/// An address may only be recorded again after its previous record was erased.
pub struct AllocationRecords {
    name: String,
    mode: AllocationTrackingMode,
    records: Mutex<HashMap<GpuAddress, AllocationRecord>>,
}

impl AllocationRecords {
    pub fn new(name: impl Into<String>, mode: AllocationTrackingMode) -> Self {
        Self {
            name: name.into(),
            mode,
            records: Mutex::new(HashMap::default()),
        }
    }

    #[inline]
    pub fn mode(&self) -> AllocationTrackingMode { self.mode }

    pub fn register_allocation(
        &self,
        address: GpuAddress,
        requested_size: u64,
        allocated_size: u64,
        alignment: u64,
    ) -> Result<(), AllocationRecordError> {
        let stack_trace = match self.mode {
            AllocationTrackingMode::Full => Some(Arc::new(Backtrace::force_capture())),
            AllocationTrackingMode::Basic => None,
        };

        match self.records.lock().entry(address) {
            Entry::Occupied(existing) => {
                log::error!(
                    "[{}] allocation at {:#x} ({} bytes) recorded twice, previous record holds {} bytes",
                    self.name,
                    address,
                    requested_size,
                    existing.get().requested_size,
                );
                Err(AllocationRecordError::DuplicateAddress(address))
            }
            Entry::Vacant(slot) => {
                slot.insert(AllocationRecord {
                    address,
                    requested_size,
                    allocated_size,
                    alignment,
                    stack_trace,
                });
                Ok(())
            }
        }
    }

    pub fn unregister_allocation(&self, address: GpuAddress) -> Result<AllocationRecord, AllocationRecordError> {
        self.records.lock().remove(&address).ok_or_else(|| {
            log::error!("[{}] deallocation of untracked address {:#x}", self.name, address);
            AllocationRecordError::MissingRecord(address)
        })
    }

    pub fn contains(&self, address: GpuAddress) -> bool {
        self.records.lock().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn requested_bytes(&self) -> u64 {
        self.records.lock().values().map(|r| r.requested_size).sum()
    }

    /// Records sorted by address.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.address);
        records
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_address_is_rejected_and_reported() {
        let records = AllocationRecords::new("test", AllocationTrackingMode::Basic);
        records.register_allocation(0x100, 16, 32, 16).unwrap();
        assert_eq!(
            records.register_allocation(0x100, 64, 64, 16),
            Err(AllocationRecordError::DuplicateAddress(0x100))
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records.snapshot()[0].requested_size, 16);
    }

    #[test]
    fn address_reusable_after_erase() {
        let records = AllocationRecords::new("test", AllocationTrackingMode::Basic);
        records.register_allocation(0x200, 8, 8, 1).unwrap();
        let erased = records.unregister_allocation(0x200).unwrap();
        assert_eq!(erased.allocated_size, 8);
        assert!(records.register_allocation(0x200, 4, 8, 1).is_ok());
    }

    #[test]
    fn missing_record_is_reported() {
        let records = AllocationRecords::new("test", AllocationTrackingMode::Basic);
        assert_eq!(
            records.unregister_allocation(0xdead).unwrap_err(),
            AllocationRecordError::MissingRecord(0xdead)
        );
    }

    #[test]
    fn full_mode_captures_stack_trace() {
        let records = AllocationRecords::new("test", AllocationTrackingMode::Full);
        records.register_allocation(0x10, 1, 1, 1).unwrap();
        records.register_allocation(0x20, 2, 2, 1).unwrap();
        assert!(records.snapshot().iter().all(|r| r.stack_trace.is_some()));
        assert_eq!(records.requested_bytes(), 3);
    }
}
