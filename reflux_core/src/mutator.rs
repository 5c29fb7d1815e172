use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Boundary constants injected by `InterestingValues`.
const INTERESTING_8: [i8; 4] = [0, -1, i8::MIN, i8::MAX];
const INTERESTING_16: [i16; 4] = [0, -1, i16::MIN, i16::MAX];
const INTERESTING_32: [i32; 4] = [0, -1, i32::MIN, i32::MAX];

/// Deltas used by `Arithmetic` unless configured otherwise.
pub const DEFAULT_ARITH_DELTAS: [u16; 4] = [1, 2, 4, 16];

/// Probability that a protocol function-code mutation stays within the valid set.
const VALID_FUNCTION_CODE_PROBABILITY: f64 = 0.6;

/// Identifies one entry of the fixed strategy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTag {
    BitFlip,
    ByteFlip,
    Arithmetic,
    InterestingValues,
    BlockDelete,
    BlockDuplicate,
    BlockSwap,
    Dictionary,
    ProtocolAware,
    Hybrid,
    External,
}

impl StrategyTag {
    pub const ALL: [StrategyTag; 11] = [
        StrategyTag::BitFlip,
        StrategyTag::ByteFlip,
        StrategyTag::Arithmetic,
        StrategyTag::InterestingValues,
        StrategyTag::BlockDelete,
        StrategyTag::BlockDuplicate,
        StrategyTag::BlockSwap,
        StrategyTag::Dictionary,
        StrategyTag::ProtocolAware,
        StrategyTag::Hybrid,
        StrategyTag::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BitFlip => "bit_flip",
            Self::ByteFlip => "byte_flip",
            Self::Arithmetic => "arithmetic",
            Self::InterestingValues => "interesting_values",
            Self::BlockDelete => "block_delete",
            Self::BlockDuplicate => "block_duplicate",
            Self::BlockSwap => "block_swap",
            Self::Dictionary => "dictionary",
            Self::ProtocolAware => "protocol_aware",
            Self::Hybrid => "hybrid",
            Self::External => "external",
        }
    }

    /// Strategies that work on raw bytes alone and can be stacked by `Hybrid`.
    pub fn is_stackable(&self) -> bool {
        !matches!(self, Self::Hybrid | Self::External)
    }
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown mutation strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyTag {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

/// Failure reported by an external payload generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// The generator could not produce payloads right now (backend down,
    /// quota exhausted, timeout on the collaborator side, ...).
    #[error("External generator '{generator}' unavailable: {reason}")]
    Unavailable { generator: String, reason: String },
}

/// A pluggable source of payloads, e.g. an LLM-backed generator.
///
/// Implementations must not panic; every failure is reported as a
/// [`GeneratorError`]. Their output is untrusted and goes through the same
/// size checks as every other strategy.
pub trait ExternalGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Produces candidate payloads derived from `seed`.
    fn generate(&self, seed: &[u8]) -> Result<Vec<Vec<u8>>, GeneratorError>;
}

/// Shared handle to an [`ExternalGenerator`].
#[derive(Clone)]
pub struct ExternalHandle(Arc<dyn ExternalGenerator>);

impl ExternalHandle {
    pub fn new(generator: Arc<dyn ExternalGenerator>) -> Self {
        Self(generator)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl fmt::Debug for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExternalHandle").field(&self.0.name()).finish()
    }
}

fn default_big_endian() -> bool {
    true
}

/// Semantic role of a protocol field, driving how `ProtocolAware` mutates it.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FieldKind {
    /// Operation selector; mutated to other valid codes or to invalid ones.
    FunctionCode {
        #[serde(default)]
        valid: Vec<u32>,
    },
    /// Register/coil/object address; mutated around its boundaries.
    Address {
        #[serde(default)]
        max: Option<u32>,
    },
    /// Byte count of everything from offset `from` to the end of the payload.
    Length {
        #[serde(default)]
        from: usize,
    },
    /// Any other integer value.
    Value,
}

/// Location and meaning of one fixed-width integer field inside a payload.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FieldSpec {
    pub name: String,
    pub offset: usize,
    /// Width in bytes: 1, 2 or 4. Fields of any other width are ignored.
    pub width: u8,
    #[serde(default = "default_big_endian")]
    pub big_endian: bool,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldSpec {
    fn fits(&self, data: &[u8]) -> bool {
        matches!(self.width, 1 | 2 | 4) && self.offset + self.width as usize <= data.len()
    }

    fn max_value(&self) -> u32 {
        match self.width {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        }
    }

    fn read(&self, data: &[u8]) -> u32 {
        let bytes = &data[self.offset..self.offset + self.width as usize];
        let mut value = 0u32;
        if self.big_endian {
            for &b in bytes {
                value = (value << 8) | b as u32;
            }
        } else {
            for &b in bytes.iter().rev() {
                value = (value << 8) | b as u32;
            }
        }
        value
    }

    fn write(&self, data: &mut [u8], value: u32) {
        let width = self.width as usize;
        let value = value & self.max_value();
        for i in 0..width {
            let shift = if self.big_endian {
                8 * (width - 1 - i)
            } else {
                8 * i
            };
            data[self.offset + i] = (value >> shift) as u8;
        }
    }
}

/// Protocol knowledge supplied by the protocol-aware collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub name: String,
    /// Tokens spliced in by the `Dictionary` strategy.
    pub dictionary: Vec<Vec<u8>>,
    /// Field map used by the `ProtocolAware` strategy.
    pub fields: Vec<FieldSpec>,
}

/// Tuning knobs for the built-in strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyParams {
    pub max_block: usize,
    pub arithmetic_offsets: usize,
    pub interesting_offsets: usize,
    pub dictionary_splices: usize,
    pub protocol_mutations: usize,
    pub hybrid_min_depth: usize,
    pub hybrid_max_depth: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            max_block: 32,
            arithmetic_offsets: 4,
            interesting_offsets: 4,
            dictionary_splices: 2,
            protocol_mutations: 2,
            hybrid_min_depth: 2,
            hybrid_max_depth: 3,
        }
    }
}

/// One mutation strategy and exactly the parameters it needs.
///
/// The set is closed: dispatch happens through `match`, so adding a strategy
/// forces every consumer to handle it.
#[derive(Debug, Clone)]
pub enum MutationStrategy {
    /// Flips a run of `w` consecutive bits for each width `w`.
    BitFlip { widths: Vec<u8> },
    /// Inverts a run of `w` consecutive bytes for each width `w`.
    ByteFlip { widths: Vec<usize> },
    /// Adds or subtracts a small delta on a byte or 16-bit word, once per offset.
    Arithmetic { deltas: Vec<u16>, offsets: usize },
    /// Overwrites 1, 2 or 4 bytes with a boundary constant, once per offset.
    InterestingValues { offsets: usize },
    BlockDelete { max_block: usize },
    BlockDuplicate { max_block: usize },
    BlockSwap { max_block: usize },
    /// Inserts or overwrites with protocol tokens.
    Dictionary { tokens: Arc<[Vec<u8>]>, splices: usize },
    /// Mutates field values in place, keeping the payload layout intact.
    ProtocolAware { fields: Arc<[FieldSpec]>, mutations: usize },
    /// Stacks `min_depth..=max_depth` randomly chosen stages.
    Hybrid {
        stages: Vec<MutationStrategy>,
        min_depth: usize,
        max_depth: usize,
    },
    /// Delegates to an injected generator.
    External(ExternalHandle),
}

impl MutationStrategy {
    pub fn tag(&self) -> StrategyTag {
        match self {
            Self::BitFlip { .. } => StrategyTag::BitFlip,
            Self::ByteFlip { .. } => StrategyTag::ByteFlip,
            Self::Arithmetic { .. } => StrategyTag::Arithmetic,
            Self::InterestingValues { .. } => StrategyTag::InterestingValues,
            Self::BlockDelete { .. } => StrategyTag::BlockDelete,
            Self::BlockDuplicate { .. } => StrategyTag::BlockDuplicate,
            Self::BlockSwap { .. } => StrategyTag::BlockSwap,
            Self::Dictionary { .. } => StrategyTag::Dictionary,
            Self::ProtocolAware { .. } => StrategyTag::ProtocolAware,
            Self::Hybrid { .. } => StrategyTag::Hybrid,
            Self::External(_) => StrategyTag::External,
        }
    }

    /// Applies the strategy to `input`, returning zero or more candidates.
    ///
    /// The input is never modified. Candidates are not size-checked here; see
    /// [`CandidateFilter`]. Only `External` can fail.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        input: &[u8],
        rng: &mut R,
    ) -> Result<Vec<Vec<u8>>, GeneratorError> {
        let candidates = match self {
            Self::BitFlip { widths } => widths
                .iter()
                .filter_map(|&width| bit_flip(input, width as usize, rng))
                .collect(),
            Self::ByteFlip { widths } => widths
                .iter()
                .filter_map(|&width| byte_flip(input, width, rng))
                .collect(),
            Self::Arithmetic { deltas, offsets } => (0..*offsets)
                .filter_map(|_| arithmetic(input, deltas, rng))
                .collect(),
            Self::InterestingValues { offsets } => (0..*offsets)
                .filter_map(|_| interesting_value(input, rng))
                .collect(),
            Self::BlockDelete { max_block } => {
                block_delete(input, *max_block, rng).into_iter().collect()
            }
            Self::BlockDuplicate { max_block } => {
                block_duplicate(input, *max_block, rng).into_iter().collect()
            }
            Self::BlockSwap { max_block } => {
                block_swap(input, *max_block, rng).into_iter().collect()
            }
            Self::Dictionary { tokens, splices } => (0..*splices)
                .filter_map(|_| dictionary_splice(input, tokens, rng))
                .collect(),
            Self::ProtocolAware { fields, mutations } => {
                protocol_mutations(input, fields, *mutations, rng)
            }
            Self::Hybrid {
                stages,
                min_depth,
                max_depth,
            } => hybrid(input, stages, *min_depth, *max_depth, rng)
                .into_iter()
                .collect(),
            Self::External(handle) => handle.0.generate(input)?,
        };
        Ok(candidates)
    }
}

fn bit_flip<R: Rng + ?Sized>(input: &[u8], width: usize, rng: &mut R) -> Option<Vec<u8>> {
    let total_bits = input.len() * 8;
    if width == 0 || total_bits < width {
        return None;
    }
    let start = rng.random_range(0..=total_bits - width);
    let mut out = input.to_vec();
    for bit in start..start + width {
        out[bit / 8] ^= 0x80 >> (bit % 8);
    }
    Some(out)
}

fn byte_flip<R: Rng + ?Sized>(input: &[u8], width: usize, rng: &mut R) -> Option<Vec<u8>> {
    if width == 0 || input.len() < width {
        return None;
    }
    let start = rng.random_range(0..=input.len() - width);
    let mut out = input.to_vec();
    for byte in &mut out[start..start + width] {
        *byte ^= 0xFF;
    }
    Some(out)
}

fn arithmetic<R: Rng + ?Sized>(input: &[u8], deltas: &[u16], rng: &mut R) -> Option<Vec<u8>> {
    if input.is_empty() || deltas.is_empty() {
        return None;
    }
    let delta = deltas[rng.random_range(0..deltas.len())];
    let subtract = rng.random_bool(0.5);
    let mut out = input.to_vec();
    if out.len() >= 2 && rng.random_bool(0.5) {
        let offset = rng.random_range(0..=out.len() - 2);
        let big_endian = rng.random_bool(0.5);
        let raw = [out[offset], out[offset + 1]];
        let value = if big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        };
        let value = if subtract {
            value.wrapping_sub(delta)
        } else {
            value.wrapping_add(delta)
        };
        let bytes = if big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        out[offset..offset + 2].copy_from_slice(&bytes);
    } else {
        let offset = rng.random_range(0..out.len());
        let delta = delta as u8;
        out[offset] = if subtract {
            out[offset].wrapping_sub(delta)
        } else {
            out[offset].wrapping_add(delta)
        };
    }
    Some(out)
}

fn interesting_value<R: Rng + ?Sized>(input: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if input.is_empty() {
        return None;
    }
    let widths: &[usize] = match input.len() {
        1 => &[1],
        2 | 3 => &[1, 2],
        _ => &[1, 2, 4],
    };
    let width = widths[rng.random_range(0..widths.len())];
    let offset = rng.random_range(0..=input.len() - width);
    let big_endian = rng.random_bool(0.5);
    let bytes: Vec<u8> = match width {
        1 => vec![INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8],
        2 => {
            let v = INTERESTING_16[rng.random_range(0..INTERESTING_16.len())];
            if big_endian {
                v.to_be_bytes().to_vec()
            } else {
                v.to_le_bytes().to_vec()
            }
        }
        _ => {
            let v = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())];
            if big_endian {
                v.to_be_bytes().to_vec()
            } else {
                v.to_le_bytes().to_vec()
            }
        }
    };
    let mut out = input.to_vec();
    out[offset..offset + width].copy_from_slice(&bytes);
    Some(out)
}

fn block_delete<R: Rng + ?Sized>(input: &[u8], max_block: usize, rng: &mut R) -> Option<Vec<u8>> {
    if input.len() < 2 || max_block == 0 {
        return None;
    }
    let block = rng.random_range(1..=max_block.min(input.len() - 1));
    let start = rng.random_range(0..=input.len() - block);
    let mut out = input.to_vec();
    out.drain(start..start + block);
    Some(out)
}

fn block_duplicate<R: Rng + ?Sized>(
    input: &[u8],
    max_block: usize,
    rng: &mut R,
) -> Option<Vec<u8>> {
    if input.is_empty() || max_block == 0 {
        return None;
    }
    let block = rng.random_range(1..=max_block.min(input.len()));
    let start = rng.random_range(0..=input.len() - block);
    let at = rng.random_range(0..=input.len());
    let copy = input[start..start + block].to_vec();
    let mut out = input.to_vec();
    out.splice(at..at, copy);
    Some(out)
}

fn block_swap<R: Rng + ?Sized>(input: &[u8], max_block: usize, rng: &mut R) -> Option<Vec<u8>> {
    if input.len() < 2 || max_block == 0 {
        return None;
    }
    let block = rng.random_range(1..=max_block.min(input.len() / 2));
    let first = rng.random_range(0..=input.len() - 2 * block);
    let second = rng.random_range(first + block..=input.len() - block);
    let mut out = input.to_vec();
    let (left, right) = out.split_at_mut(second);
    left[first..first + block].swap_with_slice(&mut right[..block]);
    Some(out)
}

fn dictionary_splice<R: Rng + ?Sized>(
    input: &[u8],
    tokens: &[Vec<u8>],
    rng: &mut R,
) -> Option<Vec<u8>> {
    if tokens.is_empty() {
        return None;
    }
    let token = &tokens[rng.random_range(0..tokens.len())];
    if token.is_empty() {
        return None;
    }
    let mut out = input.to_vec();
    if out.len() >= token.len() && rng.random_bool(0.5) {
        let at = rng.random_range(0..=out.len() - token.len());
        out[at..at + token.len()].copy_from_slice(token);
    } else {
        let at = rng.random_range(0..=out.len());
        out.splice(at..at, token.iter().copied());
    }
    Some(out)
}

fn protocol_mutations<R: Rng + ?Sized>(
    input: &[u8],
    fields: &[FieldSpec],
    mutations: usize,
    rng: &mut R,
) -> Vec<Vec<u8>> {
    let applicable: Vec<&FieldSpec> = fields.iter().filter(|f| f.fits(input)).collect();
    if applicable.is_empty() {
        // No usable field map for this payload: plain boundary-value injection.
        return (0..mutations)
            .filter_map(|_| interesting_value(input, rng))
            .collect();
    }
    (0..mutations)
        .map(|_| {
            let field = applicable[rng.random_range(0..applicable.len())];
            let mut out = input.to_vec();
            let value = mutate_field_value(field, input, rng);
            field.write(&mut out, value);
            out
        })
        .collect()
}

fn mutate_field_value<R: Rng + ?Sized>(field: &FieldSpec, input: &[u8], rng: &mut R) -> u32 {
    let max = field.max_value();
    let current = field.read(input);
    match &field.kind {
        FieldKind::FunctionCode { valid } => {
            if !valid.is_empty() && rng.random_bool(VALID_FUNCTION_CODE_PROBABILITY) {
                valid[rng.random_range(0..valid.len())]
            } else {
                // Look for a code outside the valid set; fall back to flipping the top bit,
                // the usual "exception response" marker.
                (0..8)
                    .map(|_| rng.random_range(0..=max))
                    .find(|code| !valid.contains(code))
                    .unwrap_or(current ^ (1 << (8 * field.width as u32 - 1)))
            }
        }
        FieldKind::Address { max: declared } => {
            let limit = declared.unwrap_or(max).min(max);
            let options = [0, 1, limit, limit.wrapping_add(1), rng.random_range(0..=max)];
            options[rng.random_range(0..options.len())]
        }
        FieldKind::Length { from } => {
            let actual = u32::try_from(input.len().saturating_sub(*from)).unwrap_or(u32::MAX);
            let options = [
                actual,
                actual.wrapping_add(1),
                actual.wrapping_sub(1),
                0,
                max,
            ];
            options[rng.random_range(0..options.len())]
        }
        FieldKind::Value => {
            let signed_max = max >> 1;
            let options = [
                0,
                1,
                max,
                signed_max,
                signed_max + 1,
                current.wrapping_add(1),
                rng.random_range(0..=max),
            ];
            options[rng.random_range(0..options.len())]
        }
    }
}

fn hybrid<R: Rng + ?Sized>(
    input: &[u8],
    stages: &[MutationStrategy],
    min_depth: usize,
    max_depth: usize,
    rng: &mut R,
) -> Option<Vec<u8>> {
    let stages: Vec<&MutationStrategy> = stages.iter().filter(|s| s.tag().is_stackable()).collect();
    if stages.is_empty() || max_depth == 0 {
        return None;
    }
    let depth = rng.random_range(min_depth.min(max_depth)..=max_depth);
    let mut current = input.to_vec();
    let mut applied = 0;
    for _ in 0..depth {
        let stage = stages[rng.random_range(0..stages.len())];
        if let Ok(mut outputs) = stage.apply(&current, rng) {
            if !outputs.is_empty() {
                let pick = rng.random_range(0..outputs.len());
                current = outputs.swap_remove(pick);
                applied += 1;
            }
        }
    }
    (applied > 0).then_some(current)
}

/// How many candidates a [`CandidateFilter`] dropped, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub empty: u64,
    pub oversized: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.empty + self.oversized
    }
}

/// Size sanity check applied to every candidate, whatever produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFilter {
    max_size: usize,
}

impl CandidateFilter {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Keeps non-empty candidates of at most `max_size` bytes.
    pub fn validate(&self, candidates: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, DropCounts) {
        let mut counts = DropCounts::default();
        let kept = candidates
            .into_iter()
            .filter(|candidate| {
                if candidate.is_empty() {
                    counts.empty += 1;
                    false
                } else if candidate.len() > self.max_size {
                    counts.oversized += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        (kept, counts)
    }
}

/// The immutable registry of strategies available to the selector.
///
/// Built once at startup and shared by reference. At most one strategy per tag;
/// `External` is present only when a generator was supplied.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    strategies: Vec<MutationStrategy>,
}

impl StrategyTable {
    /// Builds a table from explicit strategies. Later duplicates of a tag are ignored.
    pub fn new(strategies: Vec<MutationStrategy>) -> Self {
        let mut unique: Vec<MutationStrategy> = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            if !unique.iter().any(|s| s.tag() == strategy.tag()) {
                unique.push(strategy);
            }
        }
        Self { strategies: unique }
    }

    /// The standard table: every built-in strategy, configured from `params`
    /// and `profile`, plus `External` when `external` is given.
    pub fn standard(
        params: &StrategyParams,
        profile: &ProtocolProfile,
        external: Option<ExternalHandle>,
    ) -> Self {
        let basic = vec![
            MutationStrategy::BitFlip {
                widths: vec![1, 2, 4],
            },
            MutationStrategy::ByteFlip {
                widths: vec![1, 2, 4],
            },
            MutationStrategy::Arithmetic {
                deltas: DEFAULT_ARITH_DELTAS.to_vec(),
                offsets: params.arithmetic_offsets,
            },
            MutationStrategy::InterestingValues {
                offsets: params.interesting_offsets,
            },
            MutationStrategy::BlockDelete {
                max_block: params.max_block,
            },
            MutationStrategy::BlockDuplicate {
                max_block: params.max_block,
            },
            MutationStrategy::BlockSwap {
                max_block: params.max_block,
            },
            MutationStrategy::Dictionary {
                tokens: profile.dictionary.clone().into(),
                splices: params.dictionary_splices,
            },
            MutationStrategy::ProtocolAware {
                fields: profile.fields.clone().into(),
                mutations: params.protocol_mutations,
            },
        ];
        let mut strategies = basic.clone();
        strategies.push(MutationStrategy::Hybrid {
            stages: basic,
            min_depth: params.hybrid_min_depth,
            max_depth: params.hybrid_max_depth,
        });
        if let Some(handle) = external {
            strategies.push(MutationStrategy::External(handle));
        }
        Self::new(strategies)
    }

    pub fn get(&self, tag: StrategyTag) -> Option<&MutationStrategy> {
        self.strategies.iter().find(|s| s.tag() == tag)
    }

    pub fn contains(&self, tag: StrategyTag) -> bool {
        self.get(tag).is_some()
    }

    /// Tags in registration order.
    pub fn tags(&self) -> Vec<StrategyTag> {
        self.strategies.iter().map(MutationStrategy::tag).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn rng(seed: u8) -> ChaCha8Rng {
        ChaCha8Rng::from_seed([seed; 32])
    }

    fn differing_bits(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    #[test]
    fn strategy_tag_names_round_trip_through_from_str() {
        for tag in StrategyTag::ALL {
            assert_eq!(tag.as_str().parse::<StrategyTag>(), Ok(tag));
        }
        assert_eq!(
            "llm".parse::<StrategyTag>(),
            Err(UnknownStrategy("llm".to_string()))
        );
    }

    #[test]
    fn bit_flip_flips_exactly_width_bits_per_candidate() {
        let strategy = MutationStrategy::BitFlip {
            widths: vec![1, 2, 4],
        };
        let input = vec![0x00, 0xFF, 0x5A, 0xA5];
        let mut rng = rng(1);
        for _ in 0..20 {
            let out = strategy.apply(&input, &mut rng).unwrap();
            assert_eq!(out.len(), 3);
            for (candidate, width) in out.iter().zip([1, 2, 4]) {
                assert_eq!(candidate.len(), input.len());
                assert_eq!(differing_bits(&input, candidate), width);
            }
        }
    }

    #[test]
    fn bit_flip_skips_widths_larger_than_input() {
        let strategy = MutationStrategy::BitFlip { widths: vec![4, 16] };
        let out = strategy.apply(&[0x01], &mut rng(2)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn byte_flip_inverts_contiguous_bytes() {
        let strategy = MutationStrategy::ByteFlip { widths: vec![2] };
        let input = vec![0u8; 6];
        let out = strategy.apply(&input, &mut rng(3)).unwrap();
        let flipped: Vec<usize> = out[0]
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == 0xFF)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flipped.len(), 2);
        assert_eq!(flipped[1], flipped[0] + 1);
    }

    #[test]
    fn arithmetic_changes_at_most_two_adjacent_bytes() {
        let strategy = MutationStrategy::Arithmetic {
            deltas: DEFAULT_ARITH_DELTAS.to_vec(),
            offsets: 8,
        };
        let input = vec![0x10, 0x20, 0x30, 0x40, 0x50];
        let out = strategy.apply(&input, &mut rng(4)).unwrap();
        assert_eq!(out.len(), 8);
        for candidate in out {
            assert_eq!(candidate.len(), input.len());
            let changed: Vec<usize> = (0..input.len())
                .filter(|&i| input[i] != candidate[i])
                .collect();
            assert!(!changed.is_empty() && changed.len() <= 2, "{:?}", changed);
            if changed.len() == 2 {
                assert_eq!(changed[1], changed[0] + 1);
            }
        }
    }

    #[test]
    fn interesting_values_writes_boundary_constants() {
        let strategy = MutationStrategy::InterestingValues { offsets: 32 };
        let input = vec![0x42; 1];
        let allowed: Vec<u8> = INTERESTING_8.iter().map(|&v| v as u8).collect();
        for candidate in strategy.apply(&input, &mut rng(5)).unwrap() {
            assert!(allowed.contains(&candidate[0]), "{:#x}", candidate[0]);
        }
    }

    #[test]
    fn block_operations_change_length_as_expected() {
        let input: Vec<u8> = (0..16).collect();
        let mut rng = rng(6);
        for _ in 0..50 {
            let deleted = MutationStrategy::BlockDelete { max_block: 4 }
                .apply(&input, &mut rng)
                .unwrap();
            assert!(deleted[0].len() >= 12 && deleted[0].len() < 16);

            let duplicated = MutationStrategy::BlockDuplicate { max_block: 4 }
                .apply(&input, &mut rng)
                .unwrap();
            assert!(duplicated[0].len() > 16 && duplicated[0].len() <= 20);

            let swapped = MutationStrategy::BlockSwap { max_block: 4 }
                .apply(&input, &mut rng)
                .unwrap();
            let mut sorted = swapped[0].clone();
            sorted.sort_unstable();
            assert_eq!(sorted, input, "swap must permute, not alter, bytes");
        }
    }

    #[test]
    fn block_operations_decline_too_small_inputs() {
        let mut rng = rng(7);
        assert!(
            MutationStrategy::BlockDelete { max_block: 4 }
                .apply(&[1], &mut rng)
                .unwrap()
                .is_empty()
        );
        assert!(
            MutationStrategy::BlockSwap { max_block: 4 }
                .apply(&[1], &mut rng)
                .unwrap()
                .is_empty()
        );
        assert!(
            MutationStrategy::BlockDuplicate { max_block: 4 }
                .apply(&[], &mut rng)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn dictionary_splices_a_known_token() {
        let tokens: Arc<[Vec<u8>]> = vec![b"ADMIN".to_vec()].into();
        let strategy = MutationStrategy::Dictionary { tokens, splices: 4 };
        let input = b"user=guest".to_vec();
        for candidate in strategy.apply(&input, &mut rng(8)).unwrap() {
            assert!(candidate.windows(5).any(|w| w == b"ADMIN"));
        }
    }

    #[test]
    fn dictionary_without_tokens_yields_nothing() {
        let strategy = MutationStrategy::Dictionary {
            tokens: Vec::new().into(),
            splices: 4,
        };
        assert!(strategy.apply(b"abc", &mut rng(9)).unwrap().is_empty());
    }

    #[test]
    fn protocol_aware_only_touches_mapped_fields() {
        let profile = modbus_profile();
        let strategy = MutationStrategy::ProtocolAware {
            fields: profile.fields.clone().into(),
            mutations: 16,
        };
        let input = modbus_request();
        let mapped: Vec<usize> = vec![4, 5, 7, 8, 9];
        for candidate in strategy.apply(&input, &mut rng(10)).unwrap() {
            assert_eq!(candidate.len(), input.len());
            for i in 0..input.len() {
                if !mapped.contains(&i) {
                    assert_eq!(candidate[i], input[i], "unmapped byte {} changed", i);
                }
            }
        }
    }

    #[test]
    fn protocol_aware_without_fitting_fields_degrades_to_interesting_values() {
        let profile = modbus_profile();
        let strategy = MutationStrategy::ProtocolAware {
            fields: profile.fields.into(),
            mutations: 3,
        };
        let out = strategy.apply(&[0x01, 0x02], &mut rng(11)).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn field_spec_round_trips_values_in_both_endiannesses() {
        let mut data = vec![0u8; 6];
        let be = FieldSpec {
            name: "be".to_string(),
            offset: 0,
            width: 2,
            big_endian: true,
            kind: FieldKind::Value,
        };
        let le = FieldSpec {
            name: "le".to_string(),
            offset: 2,
            width: 4,
            big_endian: false,
            kind: FieldKind::Value,
        };
        be.write(&mut data, 0x1234);
        le.write(&mut data, 0xAABBCCDD);
        assert_eq!(data, vec![0x12, 0x34, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(be.read(&data), 0x1234);
        assert_eq!(le.read(&data), 0xAABBCCDD);
    }

    #[test]
    fn hybrid_stacks_stages_and_returns_one_candidate() {
        let table = StrategyTable::standard(
            &StrategyParams::default(),
            &modbus_profile(),
            None,
        );
        let hybrid = table.get(StrategyTag::Hybrid).unwrap();
        let input = modbus_request();
        let mut rng = rng(12);
        let mut changed = 0;
        for _ in 0..20 {
            let out = hybrid.apply(&input, &mut rng).unwrap();
            assert_eq!(out.len(), 1);
            if out[0] != input {
                changed += 1;
            }
        }
        assert!(changed > 10, "hybrid rarely changed the input: {}", changed);
    }

    #[test]
    fn hybrid_skips_nested_and_external_stages() {
        let offline = MutationStrategy::External(ExternalHandle::new(Arc::new(OfflineGenerator)));
        let nested = MutationStrategy::Hybrid {
            stages: vec![offline.clone()],
            min_depth: 1,
            max_depth: 1,
        };
        let strategy = MutationStrategy::Hybrid {
            stages: vec![offline, nested],
            min_depth: 1,
            max_depth: 3,
        };
        assert!(strategy.apply(b"seed", &mut rng(14)).unwrap().is_empty());
    }

    #[test]
    fn external_strategy_reports_unavailable_generator() {
        let strategy =
            MutationStrategy::External(ExternalHandle::new(Arc::new(OfflineGenerator)));
        let err = strategy.apply(b"seed", &mut rng(13)).unwrap_err();
        assert!(matches!(err, GeneratorError::Unavailable { .. }));
    }

    #[test]
    fn candidate_filter_drops_empty_and_oversized() {
        let filter = CandidateFilter::new(4);
        let (kept, counts) = filter.validate(vec![
            vec![1, 2],
            Vec::new(),
            vec![0; 5],
            vec![9; 4],
        ]);
        assert_eq!(kept, vec![vec![1, 2], vec![9; 4]]);
        assert_eq!(
            counts,
            DropCounts {
                empty: 1,
                oversized: 1
            }
        );
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn standard_table_registers_external_only_with_generator() {
        let params = StrategyParams::default();
        let profile = ProtocolProfile::default();
        let without = StrategyTable::standard(&params, &profile, None);
        assert_eq!(without.len(), 10);
        assert!(!without.contains(StrategyTag::External));

        let with = StrategyTable::standard(
            &params,
            &profile,
            Some(ExternalHandle::new(Arc::new(EchoGenerator))),
        );
        assert_eq!(with.tags(), StrategyTag::ALL.to_vec());
    }

    #[test]
    fn table_ignores_duplicate_tags() {
        let table = StrategyTable::new(vec![
            MutationStrategy::BlockDelete { max_block: 1 },
            MutationStrategy::BlockDelete { max_block: 8 },
        ]);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.get(StrategyTag::BlockDelete),
            Some(MutationStrategy::BlockDelete { max_block: 1 })
        ));
    }
}
