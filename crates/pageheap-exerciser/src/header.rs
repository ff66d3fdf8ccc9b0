//! Input header decoding.
//!
//! The first [`HEADER_LEN`] bytes of every input configure the subject:
//!
//! ```text
//! [0]     memory tag
//! [1]     hugepage region option
//! [2]     lifetime prediction mode
//! [3]     lifetime prediction strategy
//! [4]     short-lived threshold, milliseconds
//! [5..13] reserved
//! ```
//!
//! Every byte pattern decodes to a valid configuration.

use crate::subject::{
    HugeRegionCountOption, LifetimeMode, LifetimePredictionOptions, LifetimeStrategy, MemoryTag,
    SubjectConfig,
};
use core::time::Duration;

pub const HEADER_LEN: usize = 13;

/// Candidate memory tags, indexed by `byte[0] % len`.
pub const TAG_OPTIONS: [MemoryTag; 5] = [
    MemoryTag::Sampled,
    MemoryTag::NormalP0,
    MemoryTag::NormalP1,
    MemoryTag::Normal,
    MemoryTag::Cold,
];

pub fn decode_header(header: &[u8; HEADER_LEN], numa_partitions: usize) -> SubjectConfig {
    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&header[5..HEADER_LEN]);
    SubjectConfig {
        tag: memory_tag(header[0], numa_partitions),
        region_option: region_option(header[1]),
        lifetime: LifetimePredictionOptions::new(
            lifetime_mode(header[2]),
            lifetime_strategy(header[3]),
            lifetime_threshold(header[4]),
        ),
        reserved,
    }
}

/// The second normal partition only exists with more than one NUMA partition.
pub fn memory_tag(byte: u8, numa_partitions: usize) -> MemoryTag {
    match TAG_OPTIONS[byte as usize % TAG_OPTIONS.len()] {
        MemoryTag::NormalP1 if numa_partitions == 1 => MemoryTag::NormalP0,
        tag => tag,
    }
}

pub fn region_option(byte: u8) -> HugeRegionCountOption {
    if byte >= 128 {
        HugeRegionCountOption::Slack
    } else {
        HugeRegionCountOption::AbandonedCount
    }
}

pub fn lifetime_mode(byte: u8) -> LifetimeMode {
    match byte {
        0..=84 => LifetimeMode::Enabled,
        85..=169 => LifetimeMode::Disabled,
        _ => LifetimeMode::Counterfactual,
    }
}

pub fn lifetime_strategy(byte: u8) -> LifetimeStrategy {
    if byte >= 128 {
        LifetimeStrategy::AlwaysShortLivedRegions
    } else {
        LifetimeStrategy::PredictedLifetimeRegions
    }
}

pub fn lifetime_threshold(byte: u8) -> Duration {
    Duration::from_millis(u64::from(byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prefix: &[u8]) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[..prefix.len()].copy_from_slice(prefix);
        h
    }

    #[test]
    fn tag_cycles_through_options() {
        assert_eq!(memory_tag(0, 2), MemoryTag::Sampled);
        assert_eq!(memory_tag(1, 2), MemoryTag::NormalP0);
        assert_eq!(memory_tag(2, 2), MemoryTag::NormalP1);
        assert_eq!(memory_tag(3, 2), MemoryTag::Normal);
        assert_eq!(memory_tag(4, 2), MemoryTag::Cold);
        assert_eq!(memory_tag(5, 2), MemoryTag::Sampled);
        assert_eq!(memory_tag(255, 2), MemoryTag::Sampled);
    }

    #[test]
    fn single_partition_folds_p1_into_p0() {
        assert_eq!(memory_tag(2, 1), MemoryTag::NormalP0);
        assert_eq!(memory_tag(7, 1), MemoryTag::NormalP0);
        for byte in 0..=255u8 {
            assert_ne!(memory_tag(byte, 1), MemoryTag::NormalP1);
        }
    }

    #[test]
    fn threshold_boundaries() {
        assert_eq!(region_option(127), HugeRegionCountOption::AbandonedCount);
        assert_eq!(region_option(128), HugeRegionCountOption::Slack);

        assert_eq!(lifetime_mode(84), LifetimeMode::Enabled);
        assert_eq!(lifetime_mode(85), LifetimeMode::Disabled);
        assert_eq!(lifetime_mode(169), LifetimeMode::Disabled);
        assert_eq!(lifetime_mode(170), LifetimeMode::Counterfactual);

        assert_eq!(
            lifetime_strategy(127),
            LifetimeStrategy::PredictedLifetimeRegions
        );
        assert_eq!(
            lifetime_strategy(128),
            LifetimeStrategy::AlwaysShortLivedRegions
        );
    }

    #[test]
    fn full_header() {
        let mut h = header(&[3, 200, 10, 255, 42]);
        h[5..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let config = decode_header(&h, 1);
        assert_eq!(config.tag, MemoryTag::Normal);
        assert_eq!(config.region_option, HugeRegionCountOption::Slack);
        assert_eq!(config.lifetime.mode, LifetimeMode::Enabled);
        assert_eq!(
            config.lifetime.strategy,
            LifetimeStrategy::AlwaysShortLivedRegions
        );
        assert_eq!(config.lifetime.threshold, Duration::from_millis(42));
        assert_eq!(config.reserved, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn reserved_bytes_do_not_change_behavior() {
        let a = decode_header(&header(&[1, 2, 3, 4, 5]), 1);
        let mut hb = header(&[1, 2, 3, 4, 5]);
        hb[5..].fill(0xFF);
        let b = decode_header(&hb, 1);
        assert_eq!(a.tag, b.tag);
        assert_eq!(a.region_option, b.region_option);
        assert_eq!(a.lifetime, b.lifetime);
    }
}
