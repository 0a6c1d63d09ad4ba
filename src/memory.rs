//! Output buffer allocation.
//!
//! The engine never allocates output tensors itself. It asks a
//! [`MemoryAllocator`] for a buffer in the memory domain the model wants its
//! outputs in, and hands the buffer back with the same
//! `(domain, region_id, byte_size)` triple once the response is dropped.
//!
//! Two allocators are provided:
//! - [`HostAllocator`]: plain heap buffers, host domain only
//! - [`PooledAllocator`]: per-device byte budgets for both domains

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::MemoryOptions;
use crate::error::{Error, Result};

/// Address space a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryDomain {
    /// Host-resident memory
    Host,
    /// Accelerator-resident memory; the region id is the device index
    Accelerator,
}

impl Default for MemoryDomain {
    fn default() -> Self {
        Self::Host
    }
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// An allocated byte buffer and the triple it was allocated with.
pub struct Buffer {
    bytes: Box<[u8]>,
    domain: MemoryDomain,
    region_id: i64,
}

impl Buffer {
    /// Wrap zeroed storage of `byte_size` bytes.
    ///
    /// Intended for [`MemoryAllocator`] implementations.
    pub fn zeroed(domain: MemoryDomain, region_id: i64, byte_size: usize) -> Self {
        Self {
            bytes: vec![0u8; byte_size].into_boxed_slice(),
            domain,
            region_id,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn region_id(&self) -> i64 {
        self.region_id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Check that `(byte_size, domain, region_id)` is the allocation triple.
    fn check_triple(&self, byte_size: usize, domain: MemoryDomain, region_id: i64) -> Result<()> {
        if self.len() != byte_size || self.domain != domain || self.region_id != region_id {
            return Err(Error::invalid_arg(format!(
                "free with ({} bytes, {}, region {}) does not match allocation ({} bytes, {}, region {})",
                byte_size,
                domain,
                region_id,
                self.len(),
                self.domain,
                self.region_id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_size", &self.len())
            .field("domain", &self.domain)
            .field("region_id", &self.region_id)
            .finish()
    }
}

/// Pluggable allocation strategy for output tensors.
///
/// Implementations are shared across worker tasks and must tolerate
/// concurrent `allocate`/`free` calls on distinct buffers.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate exactly `byte_size` bytes resident in `domain`.
    ///
    /// Fails with `UNAVAILABLE` when the domain is exhausted and with
    /// `INVALID_ARG` for an unsupported domain or region.
    fn allocate(&self, domain: MemoryDomain, region_id: i64, byte_size: usize) -> Result<Buffer>;

    /// Release a buffer previously returned by [`allocate`](Self::allocate)
    /// with the same triple.
    fn free(&self, buffer: Buffer, byte_size: usize, domain: MemoryDomain, region_id: i64) -> Result<()>;
}

/// Heap allocator for the host domain.
#[derive(Debug, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to hold more than `limit` bytes at once.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated and not yet freed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn reserve(&self, byte_size: usize) -> Result<()> {
        let limit = match self.limit {
            Some(limit) => limit,
            None => {
                self.in_use.fetch_add(byte_size, Ordering::AcqRel);
                return Ok(());
            }
        };

        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(byte_size).filter(|next| *next <= limit)
            })
            .map(|_| ())
            .map_err(|current| {
                Error::unavailable(format!(
                    "host memory exhausted: {} bytes requested, {} of {} in use",
                    byte_size, current, limit
                ))
            })
    }
}

impl MemoryAllocator for HostAllocator {
    fn allocate(&self, domain: MemoryDomain, region_id: i64, byte_size: usize) -> Result<Buffer> {
        if domain != MemoryDomain::Host {
            return Err(Error::invalid_arg(format!(
                "host allocator cannot allocate in {} memory",
                domain
            )));
        }
        self.reserve(byte_size)?;
        Ok(Buffer::zeroed(domain, region_id, byte_size))
    }

    fn free(&self, buffer: Buffer, byte_size: usize, domain: MemoryDomain, region_id: i64) -> Result<()> {
        buffer.check_triple(byte_size, domain, region_id)?;
        self.in_use.fetch_sub(byte_size, Ordering::AcqRel);
        Ok(())
    }
}

/// Byte budget and usage of one `(domain, region)` pool.
#[derive(Debug, Clone, Copy)]
struct PoolUsage {
    capacity: Option<usize>,
    used: usize,
}

/// Allocator enforcing per-device byte budgets.
///
/// There is a single host pool (unbounded unless a host limit is set) shared
/// by every host region id; buffers still remember the region id they were
/// requested with. One
/// accelerator pool exists per configured device; allocating on any other
/// device fails with `INVALID_ARG`. Storage is host-addressable so backends
/// without a device runtime can fill accelerator-placed outputs.
pub struct PooledAllocator {
    pools: Mutex<HashMap<(MemoryDomain, i64), PoolUsage>>,
}

impl PooledAllocator {
    pub fn new(options: &MemoryOptions) -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            pool_key(MemoryDomain::Host, 0),
            PoolUsage {
                capacity: options.host_limit_bytes,
                used: 0,
            },
        );
        for device in &options.accelerators {
            pools.insert(
                (MemoryDomain::Accelerator, device.device_id),
                PoolUsage {
                    capacity: Some(device.capacity_bytes),
                    used: 0,
                },
            );
        }

        Self {
            pools: Mutex::new(pools),
        }
    }

    /// Bytes in use in a pool, or None if the pool does not exist.
    pub fn usage(&self, domain: MemoryDomain, region_id: i64) -> Option<usize> {
        self.pools
            .lock()
            .get(&pool_key(domain, region_id))
            .map(|pool| pool.used)
    }
}

fn pool_key(domain: MemoryDomain, region_id: i64) -> (MemoryDomain, i64) {
    match domain {
        MemoryDomain::Host => (MemoryDomain::Host, 0),
        MemoryDomain::Accelerator => (MemoryDomain::Accelerator, region_id),
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(&MemoryOptions::default())
    }
}

impl MemoryAllocator for PooledAllocator {
    fn allocate(&self, domain: MemoryDomain, region_id: i64, byte_size: usize) -> Result<Buffer> {
        {
            let mut pools = self.pools.lock();
            let pool = pools
                .get_mut(&pool_key(domain, region_id))
                .ok_or_else(|| Error::invalid_arg(format!("no accelerator device {}", region_id)))?;

            let next = pool.used.checked_add(byte_size);
            match (next, pool.capacity) {
                (Some(next), Some(capacity)) if next <= capacity => pool.used = next,
                (Some(next), None) => pool.used = next,
                _ => {
                    return Err(Error::unavailable(format!(
                        "{} memory region {} exhausted: {} bytes requested, {} of {} in use",
                        domain,
                        region_id,
                        byte_size,
                        pool.used,
                        pool.capacity.unwrap_or(usize::MAX)
                    )));
                }
            }
        }

        tracing::trace!(%domain, region_id, byte_size, "allocated output buffer");
        Ok(Buffer::zeroed(domain, region_id, byte_size))
    }

    fn free(&self, buffer: Buffer, byte_size: usize, domain: MemoryDomain, region_id: i64) -> Result<()> {
        buffer.check_triple(byte_size, domain, region_id)?;

        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&pool_key(domain, region_id)).ok_or_else(|| {
            Error::internal(format!("free into unknown {} region {}", domain, region_id))
        })?;
        pool.used = pool.used.saturating_sub(byte_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcceleratorPool;
    use crate::error::ErrorCode;

    fn pooled() -> PooledAllocator {
        PooledAllocator::new(&MemoryOptions {
            host_limit_bytes: Some(1024),
            accelerators: vec![AcceleratorPool { device_id: 1, capacity_bytes: 256 }],
        })
    }

    #[test]
    fn test_host_allocate_free() {
        let allocator = HostAllocator::new();
        let buffer = allocator.allocate(MemoryDomain::Host, 0, 64).unwrap();
        assert_eq!(buffer.len(), 64);
        assert!(buffer.as_slice().iter().all(|b| *b == 0));
        assert_eq!(allocator.in_use(), 64);

        allocator.free(buffer, 64, MemoryDomain::Host, 0).unwrap();
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn test_host_rejects_accelerator() {
        let err = HostAllocator::new()
            .allocate(MemoryDomain::Accelerator, 0, 8)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_host_limit() {
        let allocator = HostAllocator::with_limit(100);
        let a = allocator.allocate(MemoryDomain::Host, 0, 60).unwrap();
        let err = allocator.allocate(MemoryDomain::Host, 0, 60).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        allocator.free(a, 60, MemoryDomain::Host, 0).unwrap();
        assert!(allocator.allocate(MemoryDomain::Host, 0, 60).is_ok());
    }

    #[test]
    fn test_free_mismatched_triple() {
        let allocator = HostAllocator::new();
        let buffer = allocator.allocate(MemoryDomain::Host, 0, 16).unwrap();
        let err = allocator.free(buffer, 8, MemoryDomain::Host, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_pooled_allocate_free_every_pool() {
        let allocator = pooled();
        for (domain, region_id, size) in [
            (MemoryDomain::Host, 0, 0),
            (MemoryDomain::Host, 0, 1024),
            (MemoryDomain::Host, 3, 17),
            (MemoryDomain::Accelerator, 1, 1),
            (MemoryDomain::Accelerator, 1, 256),
        ] {
            let buffer = allocator.allocate(domain, region_id, size).unwrap();
            assert_eq!(buffer.domain(), domain);
            assert_eq!(buffer.region_id(), region_id);
            allocator.free(buffer, size, domain, region_id).unwrap();
            assert_eq!(allocator.usage(domain, region_id), Some(0));
        }
    }

    #[test]
    fn test_pooled_host_limit_spans_regions() {
        let allocator = pooled();
        let a = allocator.allocate(MemoryDomain::Host, 0, 600).unwrap();
        let err = allocator.allocate(MemoryDomain::Host, 1, 600).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        let b = allocator.allocate(MemoryDomain::Host, 2, 424).unwrap();
        assert_eq!(b.region_id(), 2);
        assert_eq!(allocator.usage(MemoryDomain::Host, 5), Some(1024));

        allocator.free(b, 424, MemoryDomain::Host, 2).unwrap();
        allocator.free(a, 600, MemoryDomain::Host, 0).unwrap();
        assert_eq!(allocator.usage(MemoryDomain::Host, 0), Some(0));
        assert!(allocator.allocate(MemoryDomain::Host, 1, 1024).is_ok());
    }

    #[test]
    fn test_pooled_device_budget() {
        let allocator = pooled();
        let a = allocator.allocate(MemoryDomain::Accelerator, 1, 200).unwrap();
        assert_eq!(allocator.usage(MemoryDomain::Accelerator, 1), Some(200));

        let err = allocator.allocate(MemoryDomain::Accelerator, 1, 100).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        allocator.free(a, 200, MemoryDomain::Accelerator, 1).unwrap();
        assert!(allocator.allocate(MemoryDomain::Accelerator, 1, 100).is_ok());
    }

    #[test]
    fn test_pooled_unknown_device() {
        let err = pooled().allocate(MemoryDomain::Accelerator, 7, 8).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
        assert_eq!(pooled().usage(MemoryDomain::Accelerator, 7), None);
    }

    #[test]
    fn test_pooled_concurrent_use() {
        let allocator = std::sync::Arc::new(PooledAllocator::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buffer = allocator.allocate(MemoryDomain::Host, 0, i + 1).unwrap();
                        allocator.free(buffer, i + 1, MemoryDomain::Host, 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(allocator.usage(MemoryDomain::Host, 0), Some(0));
    }
}
