//! Partition fan-out onto dispatch queues.
//!
//! Messages from one partition always land on the same logical queue, so
//! per-partition order survives cross-partition parallelism. The mapping
//! is deterministic and stable for the life of a consumer entry.

use crate::config::DispatchPolicy;

/// Maps a partition to its dispatch queue index.
///
/// *Serial* collapses everything onto queue 0; *RoundRobin* spreads
/// partitions across `num_queues` with `partition mod N`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn map_partition_to_queue(
    partition: i32,
    policy: DispatchPolicy,
    num_queues: usize,
) -> usize {
    match policy {
        DispatchPolicy::Serial => 0,
        DispatchPolicy::RoundRobin => {
            if num_queues == 0 {
                0
            } else {
                partition.rem_euclid(num_queues as i32) as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_always_queue_zero() {
        for partition in 0..16 {
            assert_eq!(
                map_partition_to_queue(partition, DispatchPolicy::Serial, 4),
                0
            );
        }
    }

    #[test]
    fn test_round_robin_is_partition_mod_n() {
        assert_eq!(map_partition_to_queue(0, DispatchPolicy::RoundRobin, 4), 0);
        assert_eq!(map_partition_to_queue(5, DispatchPolicy::RoundRobin, 4), 1);
        assert_eq!(map_partition_to_queue(7, DispatchPolicy::RoundRobin, 4), 3);
        assert_eq!(map_partition_to_queue(8, DispatchPolicy::RoundRobin, 4), 0);
    }

    #[test]
    fn test_mapping_is_stable() {
        let first = map_partition_to_queue(11, DispatchPolicy::RoundRobin, 3);
        for _ in 0..100 {
            assert_eq!(
                map_partition_to_queue(11, DispatchPolicy::RoundRobin, 3),
                first
            );
        }
    }

    #[test]
    fn test_negative_partition_does_not_panic() {
        let q = map_partition_to_queue(-1, DispatchPolicy::RoundRobin, 4);
        assert!(q < 4);
    }
}
