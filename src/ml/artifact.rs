//! Trained model artifacts
//!
//! An artifact bundles everything a trained detector needs at scoring time:
//! the fitted parameters, the feature scaler, the score calibrator and
//! training metadata. On disk it is a bincode envelope whose header carries
//! the type tag and version in the clear, followed by the encoded body and its
//! SHA-256 checksum.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{ConfigError, ModelUnavailable, Result, SurveillanceError};
use crate::ml::models::ensemble::calibration::ScoreCalibrator;
use crate::ml::models::{Autoencoder, IsolationForest, SequenceModel};
use crate::ml::normalization::FeatureScaler;
use crate::ml::DetectorId;

/// Envelope layout revision
pub const ARTIFACT_FORMAT: u32 = 1;

/// Which trainable detector an artifact belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    IsolationForest,
    Autoencoder,
    Sequence,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::IsolationForest,
        ArtifactKind::Autoencoder,
        ArtifactKind::Sequence,
    ];

    /// Type tag stored in the envelope header
    pub fn tag(&self) -> &'static str {
        match self {
            ArtifactKind::IsolationForest => "isolation_forest",
            ArtifactKind::Autoencoder => "autoencoder",
            ArtifactKind::Sequence => "sequence",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Detector slot this kind fills
    pub fn detector(&self) -> DetectorId {
        match self {
            ArtifactKind::IsolationForest => DetectorId::Outlier,
            ArtifactKind::Autoencoder => DetectorId::Reconstruction,
            ArtifactKind::Sequence => DetectorId::Sequence,
        }
    }

    pub fn for_detector(id: DetectorId) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.detector() == id)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Semantic version of an artifact
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for ModelVersion {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ModelVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidParameter {
            name: "model_version",
            reason: format!("`{s}` is not MAJOR.MINOR.PATCH"),
        };
        let mut parts = s.trim().split('.').map(|p| p.parse::<u32>().map_err(|_| invalid()));
        let version = Self::new(
            parts.next().ok_or_else(invalid)??,
            parts.next().ok_or_else(invalid)??,
            parts.next().ok_or_else(invalid)??,
        );
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

/// Fitted parameters, one variant per artifact kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelParams {
    IsolationForest(IsolationForest),
    Autoencoder(Autoencoder),
    Sequence(SequenceModel),
}

impl ModelParams {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ModelParams::IsolationForest(_) => ArtifactKind::IsolationForest,
            ModelParams::Autoencoder(_) => ArtifactKind::Autoencoder,
            ModelParams::Sequence(_) => ArtifactKind::Sequence,
        }
    }
}

/// Provenance recorded at training time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub trained_at: DateTime<Utc>,
    /// Rows (or windows) the parameters were fitted on
    pub training_samples: usize,
    /// Held-out rows (or windows) the calibrator was fitted on
    pub calibration_samples: usize,
    pub seed: u64,
    pub crate_version: String,
    pub window_length: usize,
    pub feature_names: Vec<String>,
}

/// Everything inside the checksummed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArtifactBody {
    version: ModelVersion,
    scaler: FeatureScaler,
    calibrator: ScoreCalibrator,
    params: ModelParams,
    metadata: ArtifactMetadata,
}

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    format: u32,
    tag: String,
    version: ModelVersion,
    checksum: String,
    payload: Vec<u8>,
}

/// Immutable trained model, shared by `Arc` across scoring calls
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModelArtifact {
    body: ArtifactBody,
    checksum: String,
}

impl TrainedModelArtifact {
    pub fn new(
        version: ModelVersion,
        scaler: FeatureScaler,
        calibrator: ScoreCalibrator,
        params: ModelParams,
        metadata: ArtifactMetadata,
    ) -> Result<Self> {
        let body = ArtifactBody {
            version,
            scaler,
            calibrator,
            params,
            metadata,
        };
        let checksum = sha256_hex(&encode(&body)?);
        Ok(Self { body, checksum })
    }

    pub fn kind(&self) -> ArtifactKind {
        self.body.params.kind()
    }

    pub fn version(&self) -> &ModelVersion {
        &self.body.version
    }

    /// Width of the feature vectors the scaler was fitted on
    pub fn feature_dim(&self) -> usize {
        self.body.scaler.dimension()
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.body.scaler
    }

    pub fn calibrator(&self) -> &ScoreCalibrator {
        &self.body.calibrator
    }

    pub fn params(&self) -> &ModelParams {
        &self.body.params
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.body.metadata
    }

    /// Hex SHA-256 of the encoded payload
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Encode into the envelope format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = encode(&self.body)?;
        let envelope = Envelope {
            format: ARTIFACT_FORMAT,
            tag: self.kind().tag().to_string(),
            version: self.body.version.clone(),
            checksum: sha256_hex(&payload),
            payload,
        };
        encode(&envelope)
    }

    /// Decode and verify an artifact of any kind.
    ///
    /// Structural problems and checksum failures are `ModelUnavailable`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope = decode_envelope(bytes)?;
        Self::open(envelope)
    }

    /// Decode an artifact for a specific detector.
    ///
    /// A readable header with the wrong type tag is a configuration error,
    /// raised before the payload is even verified.
    pub fn from_bytes_as(bytes: &[u8], expected: ArtifactKind) -> Result<Self> {
        let envelope = decode_envelope(bytes)?;
        if envelope.tag != expected.tag() {
            return Err(ConfigError::ArtifactKindMismatch {
                expected: expected.detector(),
                found: envelope.tag,
            }
            .into());
        }
        Self::open(envelope)
    }

    fn open(envelope: Envelope) -> Result<Self> {
        if envelope.format != ARTIFACT_FORMAT {
            return Err(ModelUnavailable::Undecodable(format!(
                "unsupported envelope format {}",
                envelope.format
            ))
            .into());
        }

        let computed = sha256_hex(&envelope.payload);
        if computed != envelope.checksum {
            return Err(ModelUnavailable::ChecksumMismatch {
                recorded: envelope.checksum,
                computed,
            }
            .into());
        }

        let (body, _): (ArtifactBody, usize) =
            bincode::serde::decode_from_slice(&envelope.payload, bincode::config::standard())
                .map_err(|e| ModelUnavailable::Undecodable(e.to_string()))?;

        let kind = body.params.kind();
        if kind.tag() != envelope.tag || body.version != envelope.version {
            return Err(ModelUnavailable::Corrupt {
                detector: kind.detector(),
                reason: format!(
                    "header says {} v{}, payload holds {} v{}",
                    envelope.tag, envelope.version, kind, body.version
                ),
            }
            .into());
        }

        debug!(kind = %kind, version = %body.version, "decoded artifact");
        Ok(Self {
            body,
            checksum: computed,
        })
    }

    /// Write the encoded artifact to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;

        info!(kind = %self.kind(), version = %self.version(), path = %path.display(), "saved artifact");
        Ok(())
    }

    /// Read and verify an artifact file of any kind
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let artifact = Self::from_bytes(&read_file(path.as_ref())?)?;
        info!(kind = %artifact.kind(), version = %artifact.version(), path = %path.as_ref().display(), "loaded artifact");
        Ok(artifact)
    }

    /// Read and verify an artifact file for a specific detector
    pub fn load_as<P: AsRef<Path>>(path: P, expected: ArtifactKind) -> Result<Self> {
        let artifact = Self::from_bytes_as(&read_file(path.as_ref())?, expected)?;
        info!(kind = %artifact.kind(), version = %artifact.version(), path = %path.as_ref().display(), "loaded artifact");
        Ok(artifact)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SurveillanceError::Serialization(e.to_string()))
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let (envelope, _): (Envelope, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ModelUnavailable::Undecodable(e.to_string()))?;
    Ok(envelope)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
