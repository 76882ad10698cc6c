//! Swap classifier - cheap allow-list filter over a transaction's log lines.
//!
//! This runs before the transaction fetch, so false positives only cost an
//! RPC round trip; the decoder makes the real call.

/// All known swap signatures, as they appear in program logs.
pub mod program_ids {
    // Jupiter aggregator v6
    pub const JUPITER_V6_PROGRAM_ID: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapSignature {
    /// The Jupiter v6 program was invoked.
    JupiterV6,
    PreTokenSwap,
    PostTokenSwap,
    Swap2,
    Swap,
    /// Bonding-curve style launchpads (Pump.fun and similar).
    Buy,
    Sell,
}

impl SwapSignature {
    /// Checked in order; the first match wins.
    pub const ALL: [SwapSignature; 7] = [
        SwapSignature::JupiterV6,
        SwapSignature::PreTokenSwap,
        SwapSignature::PostTokenSwap,
        SwapSignature::Swap2,
        SwapSignature::Swap,
        SwapSignature::Buy,
        SwapSignature::Sell,
    ];

    /// Exact, case-sensitive substring searched for in each log line.
    pub fn needle(self) -> &'static str {
        match self {
            SwapSignature::JupiterV6 => program_ids::JUPITER_V6_PROGRAM_ID,
            SwapSignature::PreTokenSwap => "Instruction: PreTokenSwap",
            SwapSignature::PostTokenSwap => "Instruction: PostTokenSwap",
            SwapSignature::Swap2 => "Instruction: Swap2",
            SwapSignature::Swap => "Instruction: Swap",
            SwapSignature::Buy => "Instruction: Buy",
            SwapSignature::Sell => "Instruction: Sell",
        }
    }

    fn matches(self, line: &str) -> bool {
        line.contains(self.needle())
    }
}

/// First known swap signature found in `logs`, scanning line by line.
pub fn classify<S: AsRef<str>>(logs: &[S]) -> Option<SwapSignature> {
    logs.iter().find_map(|line| {
        SwapSignature::ALL
            .into_iter()
            .find(|sig| sig.matches(line.as_ref()))
    })
}

pub fn is_swap<S: AsRef<str>>(logs: &[S]) -> bool {
    classify(logs).is_some()
}
