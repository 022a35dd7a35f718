//! Witnesses and their proofs.

/// Role a witness plays in the anchoring protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WitnessType {
    /// Witness selected for a particular batch.
    Batch,
    /// System-wide witness.
    System,
}

impl std::fmt::Display for WitnessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WitnessType::Batch => write!(f, "batch"),
            WitnessType::System => write!(f, "system"),
        }
    }
}

/// A network party that attests to anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Witness {
    pub witness_type: WitnessType,
    /// Absolute URL identifying the witness service.
    pub uri: String,
    /// Whether the witness is backed by a transparency log.
    pub has_log: bool,
}

impl Witness {
    pub fn new(witness_type: WitnessType, uri: impl Into<String>) -> Self {
        Self {
            witness_type,
            uri: uri.into(),
            has_log: false,
        }
    }

    pub fn with_log(mut self, has_log: bool) -> Self {
        self.has_log = has_log;
        self
    }
}

/// A witness together with the proof it supplied, if any.
///
/// The proof bytes are opaque; a proof is present iff the bytes are
/// non-empty.
#[derive(Debug, Clone)]
pub struct WitnessProof {
    pub witness: Witness,
    pub proof: Vec<u8>,
}

impl WitnessProof {
    pub fn new(witness: Witness, proof: impl Into<Vec<u8>>) -> Self {
        Self {
            witness,
            proof: proof.into(),
        }
    }

    /// Whether a proof was supplied.
    pub fn has_proof(&self) -> bool {
        !self.proof.is_empty()
    }
}
