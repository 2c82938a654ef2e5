//! Private address ranges
//!
//! Cloud pools each get one `/24` out of `11.0.0.0/16`, identified by the
//! third octet. Allocation is first fit: the smallest index not in use is
//! returned, so ranges of removed pools are reused. The set of used ranges
//! lives in the type's global state and is only touched under the type lease.

use remex_core::domain::executor::ExecutorType;
use remex_core::domain::pool::{IpRange, PoolGlobalState};
use std::sync::Arc;

use super::PoolError;
use crate::repository::{GlobalStateStore, log_line};
use crate::service::lease::{PERSISTENT_LEASE_DEADLINE, TypeLease};

pub const VCN_CIDR: &str = "11.0.0.0/16";

/// First index that can no longer be handed out
pub const IP_RANGE_LIMIT: u16 = 255;

/// Smallest unused index in `1..255`, `None` when exhausted
pub fn next_available_ip_range(used: &[IpRange]) -> Option<IpRange> {
    let mut indices: Vec<u16> = used.iter().map(|range| range.index).collect();
    indices.sort_unstable();
    indices.dedup();

    let mut candidate = 1;
    for index in indices {
        if index < candidate {
            continue;
        }
        if index > candidate {
            break;
        }
        candidate += 1;
    }

    (candidate < IP_RANGE_LIMIT).then_some(IpRange { index: candidate })
}

pub fn subnet_mask(range: IpRange) -> String {
    format!("11.0.{}.0/24", range.index)
}

/// Inverse of [`subnet_mask`]
pub fn parse_subnet_mask(mask: &str) -> Option<IpRange> {
    let index = mask.strip_prefix("11.0.")?.strip_suffix(".0/24")?;
    if index.is_empty() || index.len() > 3 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u16 = index.parse().ok()?;
    (1..IP_RANGE_LIMIT).contains(&index).then_some(IpRange { index })
}

/// Reserve the next range in `state`
pub fn take_range(state: &mut PoolGlobalState) -> Result<IpRange, PoolError> {
    let range = next_available_ip_range(&state.ips_used).ok_or(PoolError::AddressSpaceDepleted)?;
    state.ips_used.push(range);
    state.ips_used.sort();
    Ok(range)
}

/// Give `range` back, returning whether it was reserved
pub fn return_range(state: &mut PoolGlobalState, range: IpRange) -> bool {
    let before = state.ips_used.len();
    state.ips_used.retain(|used| *used != range);
    state.ips_used.len() != before
}

/// Allocates ranges from the global state of one executor type
#[derive(Clone)]
pub struct IpAllocator {
    store: Arc<dyn GlobalStateStore>,
    executor_type: ExecutorType,
}

impl IpAllocator {
    pub fn new(store: Arc<dyn GlobalStateStore>, executor_type: ExecutorType) -> Self {
        Self {
            store,
            executor_type,
        }
    }

    pub async fn allocate(&self) -> Result<IpRange, PoolError> {
        let lease = TypeLease::acquire(self.store.clone(), self.executor_type).await?;
        let result = self.allocate_leased(&lease).await;
        lease.release().await?;
        result
    }

    async fn allocate_leased(&self, lease: &TypeLease) -> Result<IpRange, PoolError> {
        let store = lease.store();
        let mut state = PoolGlobalState::from_value(&store.state(self.executor_type).await?);
        let range = match take_range(&mut state) {
            Ok(range) => range,
            Err(err) => {
                store
                    .append_log(self.executor_type, &log_line(&err.to_string()))
                    .await?;
                return Err(err);
            }
        };
        store
            .set_state(self.executor_type, &serde_json::to_value(&state)?)
            .await?;
        store
            .append_log(
                self.executor_type,
                &log_line(&format!("Reserved address range {}", subnet_mask(range))),
            )
            .await?;
        Ok(range)
    }

    pub async fn release(&self, range: IpRange) -> Result<(), PoolError> {
        let lease = TypeLease::acquire(self.store.clone(), self.executor_type).await?;
        let result = self.release_leased(&lease, range).await;
        lease.release().await?;
        result
    }

    /// Release that waits out other holders of the lease instead of giving
    /// up after the usual few attempts
    pub async fn release_persistent(&self, range: IpRange) -> Result<(), PoolError> {
        let lease =
            TypeLease::acquire_within(self.store.clone(), self.executor_type, PERSISTENT_LEASE_DEADLINE)
                .await?;
        let result = self.release_leased(&lease, range).await;
        lease.release().await?;
        result
    }

    async fn release_leased(&self, lease: &TypeLease, range: IpRange) -> Result<(), PoolError> {
        let store = lease.store();
        let mut state = PoolGlobalState::from_value(&store.state(self.executor_type).await?);
        if !return_range(&mut state, range) {
            tracing::warn!("Address range {} was not reserved", subnet_mask(range));
            return Ok(());
        }
        store
            .set_state(self.executor_type, &serde_json::to_value(&state)?)
            .await?;
        store
            .append_log(
                self.executor_type,
                &log_line(&format!("Released address range {}", subnet_mask(range))),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use serde_json::json;

    fn ranges(indices: &[u16]) -> Vec<IpRange> {
        indices.iter().map(|&index| IpRange { index }).collect()
    }

    #[test]
    fn test_first_fit() {
        assert_eq!(next_available_ip_range(&[]), Some(IpRange { index: 1 }));
        assert_eq!(next_available_ip_range(&ranges(&[1, 3])), Some(IpRange { index: 2 }));
        assert_eq!(next_available_ip_range(&ranges(&[3, 1, 2])), Some(IpRange { index: 4 }));
        assert_eq!(next_available_ip_range(&ranges(&[2, 3])), Some(IpRange { index: 1 }));
    }

    #[test]
    fn test_exhausted_at_limit() {
        let all: Vec<u16> = (1..255).collect();
        assert_eq!(next_available_ip_range(&ranges(&all)), None);

        let almost: Vec<u16> = (1..254).collect();
        assert_eq!(next_available_ip_range(&ranges(&almost)), Some(IpRange { index: 254 }));
    }

    #[test]
    fn test_subnet_mask_parsing() {
        assert_eq!(subnet_mask(IpRange { index: 7 }), "11.0.7.0/24");
        assert_eq!(parse_subnet_mask("11.0.7.0/24"), Some(IpRange { index: 7 }));
        assert_eq!(parse_subnet_mask("11.0.254.0/24"), Some(IpRange { index: 254 }));
        assert_eq!(parse_subnet_mask("11.0.0.0/24"), None);
        assert_eq!(parse_subnet_mask("11.0.255.0/24"), None);
        assert_eq!(parse_subnet_mask("11.0.1234.0/24"), None);
        assert_eq!(parse_subnet_mask("10.0.7.0/24"), None);
        assert_eq!(parse_subnet_mask("11.0.7.0/16"), None);
    }

    #[test]
    fn test_take_and_return() {
        let mut state = PoolGlobalState::default();
        assert_eq!(take_range(&mut state).unwrap(), IpRange { index: 1 });
        assert_eq!(take_range(&mut state).unwrap(), IpRange { index: 2 });
        assert!(return_range(&mut state, IpRange { index: 1 }));
        assert!(!return_range(&mut state, IpRange { index: 1 }));
        assert_eq!(take_range(&mut state).unwrap(), IpRange { index: 1 });
    }

    #[tokio::test]
    async fn test_allocate_persists_and_releases_lease() {
        let store = MemoryStore::new();
        let allocator = IpAllocator::new(Arc::new(store.clone()), ExecutorType::OciBasic);

        assert_eq!(allocator.allocate().await.unwrap(), IpRange { index: 1 });
        assert!(!store.is_locked(ExecutorType::OciBasic));

        let state = store.state(ExecutorType::OciBasic).await.unwrap();
        assert_eq!(state["ipsUsed"], json!([{ "index": 1 }]));

        allocator.release(IpRange { index: 1 }).await.unwrap();
        let state = store.state(ExecutorType::OciBasic).await.unwrap();
        assert_eq!(state["ipsUsed"], json!([]));
        assert!(store.log(ExecutorType::OciBasic).await.unwrap().contains("Released"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_allocations_never_share_index() {
        let store = MemoryStore::new();
        store
            .set_state(
                ExecutorType::OciBasic,
                &json!({ "ipsUsed": [{ "index": 1 }, { "index": 3 }] }),
            )
            .await
            .unwrap();
        let allocator = IpAllocator::new(Arc::new(store.clone()), ExecutorType::OciBasic);

        let (a, b) = tokio::join!(allocator.allocate(), allocator.allocate());
        let mut got = vec![a.unwrap().index, b.unwrap().index];
        got.sort();
        assert_eq!(got, vec![2, 4]);

        let state = PoolGlobalState::from_value(&store.state(ExecutorType::OciBasic).await.unwrap());
        assert_eq!(state.ips_used, ranges(&[1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_depleted_is_logged() {
        let store = MemoryStore::new();
        let all: Vec<_> = (1..255).map(|index| json!({ "index": index })).collect();
        store
            .set_state(ExecutorType::OciBasic, &json!({ "ipsUsed": all }))
            .await
            .unwrap();
        let allocator = IpAllocator::new(Arc::new(store.clone()), ExecutorType::OciBasic);

        let err = allocator.allocate().await.unwrap_err();
        assert_eq!(err.to_string(), "Dedicated IP address space depleted");
        assert!(!store.is_locked(ExecutorType::OciBasic));
        assert!(
            store
                .log(ExecutorType::OciBasic)
                .await
                .unwrap()
                .contains("depleted")
        );
    }
}
