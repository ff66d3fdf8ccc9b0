use core::fmt;
use core::time::Duration;

/// Which part of the address space a subject instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTag {
    Sampled,
    NormalP0,
    NormalP1,
    Normal,
    Cold,
}

impl MemoryTag {
    pub const fn name(self) -> &'static str {
        match self {
            MemoryTag::Sampled => "SAMPLED",
            MemoryTag::NormalP0 => "NORMAL_P0",
            MemoryTag::NormalP1 => "NORMAL_P1",
            MemoryTag::Normal => "NORMAL",
            MemoryTag::Cold => "COLD",
        }
    }
}

impl fmt::Display for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the subject chooses among hugepages that can satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HugeRegionCountOption {
    /// Pack densely: prefer the fitting hugepage with the least free space.
    Slack,
    /// Take the first fitting hugepage in address order.
    AbandonedCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeMode {
    Enabled,
    Disabled,
    /// Predict and record, but never act on the prediction.
    Counterfactual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeStrategy {
    AlwaysShortLivedRegions,
    PredictedLifetimeRegions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LifetimePredictionOptions {
    pub mode: LifetimeMode,
    pub strategy: LifetimeStrategy,
    /// Spans expected to live shorter than this are treated as short-lived.
    pub threshold: Duration,
}

impl LifetimePredictionOptions {
    pub const fn new(mode: LifetimeMode, strategy: LifetimeStrategy, threshold: Duration) -> Self {
        LifetimePredictionOptions {
            mode,
            strategy,
            threshold,
        }
    }

    pub const fn disabled() -> Self {
        Self::new(
            LifetimeMode::Disabled,
            LifetimeStrategy::PredictedLifetimeRegions,
            Duration::ZERO,
        )
    }

    /// Whether predictions are computed at all.
    pub fn predicts(&self) -> bool {
        self.mode != LifetimeMode::Disabled
    }

    /// Whether predictions influence placement.
    pub fn places(&self) -> bool {
        self.mode == LifetimeMode::Enabled
    }
}

/// Everything needed to construct a subject. Built once per run from the
/// input header and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectConfig {
    pub tag: MemoryTag,
    pub region_option: HugeRegionCountOption,
    pub lifetime: LifetimePredictionOptions,
    /// Header bytes with no assigned meaning, carried verbatim.
    pub reserved: [u8; 8],
}

impl Default for SubjectConfig {
    fn default() -> Self {
        SubjectConfig {
            tag: MemoryTag::Normal,
            region_option: HugeRegionCountOption::AbandonedCount,
            lifetime: LifetimePredictionOptions::disabled(),
            reserved: [0; 8],
        }
    }
}
