//! Tree engine configuration.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_encoding::Optional;

use crate::store::{SEGMENT_LENGTH, Segment};

/// Performance level.
///
/// Selects the first rung of the group size ladder. Higher levels commit more leaves per validated root, at the cost
/// of more work being discarded when a root is rejected.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceLevel {
    /// - groups start at 200 leaves
    Low,
    /// - groups start at 800 leaves
    Medium,
    /// - groups start at 1600 leaves
    #[default]
    High,
    /// - groups start at 8000 leaves
    ///
    /// WARNING: a single rejected root near the end of a large group discards the work of the whole group.
    Maximum,
}

impl PerformanceLevel {
    fn serialized_version() -> u8 {
        0
    }

    /// Returns the number of leaves in the first group committed from a shard's write queue.
    #[must_use]
    pub fn starting_group_size(&self) -> usize {
        match self {
            Self::Low => 200,
            Self::Medium => 800,
            Self::High => 1600,
            Self::Maximum => 8000,
        }
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;

        Ok(match reader.read_u8()? {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            3 => Self::Maximum,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "failed to read valid performance level",
                ));
            }
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;

        writer.write_u8(match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Maximum => 3,
        })?;

        Ok(())
    }
}

impl std::fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Maximum => write!(f, "maximum"),
        }
    }
}

/// Engine configuration shared by every tree kind.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct MerkletreeConfig {
    /// Performance level
    pub performance_level: PerformanceLevel,
}

impl MerkletreeConfig {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let performance_level = PerformanceLevel::read(reader)?;

        Ok(Self { performance_level })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        self.performance_level.write(writer)?;

        Ok(())
    }
}

/// Operating mode of the transaction id tree.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Roots are validated against an authoritative source and not archived.
    #[default]
    Client,
    /// Every committed root is archived so it can be served to clients.
    Authoritative,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Authoritative => write!(f, "authoritative"),
        }
    }
}

/// Transaction id tree configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TxidTreeConfig {
    /// Operating mode
    pub operating_mode: OperatingMode,
    /// First block at which proofs of innocence are required. `None` disables the launch snapshot.
    pub poi_launch_block: Option<u64>,
}

impl TxidTreeConfig {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let operating_mode = match reader.read_u8()? {
            0 => OperatingMode::Client,
            1 => OperatingMode::Authoritative,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "failed to read valid operating mode",
                ));
            }
        };
        let poi_launch_block = Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?;

        Ok(Self {
            operating_mode,
            poi_launch_block,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        writer.write_u8(match self.operating_mode {
            OperatingMode::Client => 0,
            OperatingMode::Authoritative => 1,
        })?;
        Optional::write(&mut writer, self.poi_launch_block, |w, block| {
            w.write_u64::<LittleEndian>(block)
        })?;

        Ok(())
    }
}

/// Chain family.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainType {
    /// EVM compatible chain
    #[default]
    Evm,
}

impl ChainType {
    fn to_u8(self) -> u8 {
        match self {
            Self::Evm => 0,
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evm => write!(f, "evm"),
        }
    }
}

/// Network a tree replicates. Part of every persisted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chain {
    /// Chain family
    pub chain_type: ChainType,
    /// Chain id
    pub id: u64,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            chain_type: ChainType::Evm,
            id: 1,
        }
    }
}

impl Chain {
    /// Returns the key segment identifying this chain. The chain type occupies byte 23 and the id is big-endian in the
    /// last 8 bytes.
    #[must_use]
    pub fn segment(&self) -> Segment {
        let mut segment = [0u8; SEGMENT_LENGTH];
        segment[23] = self.chain_type.to_u8();
        segment[24..].copy_from_slice(&self.id.to_be_bytes());
        segment
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txid_tree_config_round_trips() {
        let config = TxidTreeConfig {
            operating_mode: OperatingMode::Authoritative,
            poi_launch_block: Some(18_500_000),
        };
        let mut bytes = Vec::new();
        config.write(&mut bytes).unwrap();
        assert_eq!(TxidTreeConfig::read(&bytes[..]).unwrap(), config);
    }

    #[test]
    fn invalid_performance_level_is_rejected() {
        assert!(PerformanceLevel::read(&[0u8, 9][..]).is_err());
        assert_eq!(
            PerformanceLevel::read(&[0u8, 3][..]).unwrap(),
            PerformanceLevel::Maximum
        );
    }

    #[test]
    fn chain_segment_layout() {
        let segment = Chain {
            chain_type: ChainType::Evm,
            id: 137,
        }
        .segment();
        assert!(segment[..23].iter().all(|byte| *byte == 0));
        assert_eq!(segment[23], 0);
        assert_eq!(segment[31], 137);
    }
}
