//! Per-model output-token ceilings.
//!
//! The upstream rejects requests whose output-limit fields exceed the model's
//! documented maximum, so the dispatcher clamps rather than forwarding the
//! caller's value verbatim. This is a per-model table, not one global constant.

/// Ceiling applied to unknown model names.
pub const DEFAULT_OUTPUT_CEILING: u32 = 32_768;

/// Much smaller ceiling used for the degraded quota-retry payload.
pub const DEGRADE_OUTPUT_CEILING: u32 = 4_096;

const OUTPUT_CEILINGS: &[(&str, u32)] = &[
    ("qwen3-coder-plus", 65_536),
    ("qwen3-coder-flash", 65_536),
    ("qwen3-max", 65_536),
    ("vision-model", 8_192),
];

/// Documented output-token ceiling for `model`.
///
/// Dated snapshot names (`qwen3-coder-plus-2025-07-22`) share their base
/// model's ceiling, hence the prefix match after the exact lookup.
pub fn output_ceiling(model: &str) -> u32 {
    if let Some((_, cap)) = OUTPUT_CEILINGS.iter().find(|(name, _)| *name == model) {
        return *cap;
    }

    OUTPUT_CEILINGS
        .iter()
        .find(|(name, _)| model.starts_with(name))
        .map_or(DEFAULT_OUTPUT_CEILING, |(_, cap)| *cap)
}
