//! Serialization and de-serialization of persisted tree records including utilities.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_encoding::{Optional, Vector};

use crate::TREE_DEPTH;
use crate::hash::Node;
use crate::merkletree::{InvalidMerklerootDetails, LeafData, TreeMetadata};
use crate::txid::{PoiLaunchSnapshot, TransactionRecord};
use crate::utxo::{
    Commitment, CommitmentKind, CommitmentPreimage, Nullifier, TokenData, TokenType,
    UnshieldEvent,
};

pub(crate) fn read_node<R: Read>(mut reader: R) -> std::io::Result<Node> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes)?;

    Ok(Node::from_bytes(bytes))
}

pub(crate) fn write_node<W: Write>(mut writer: W, node: &Node) -> std::io::Result<()> {
    writer.write_all(node.as_bytes())
}

fn read_address<R: Read>(mut reader: R) -> std::io::Result<[u8; 20]> {
    let mut address = [0u8; 20];
    reader.read_exact(&mut address)?;

    Ok(address)
}

fn read_bytes<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
    Vector::read(&mut reader, |r| r.read_u8())
}

fn write_bytes<W: Write>(mut writer: W, bytes: &[u8]) -> std::io::Result<()> {
    Vector::write(&mut writer, bytes, |w, byte| w.write_u8(*byte))
}

fn read_timestamp<R: Read>(mut reader: R) -> std::io::Result<Option<u64>> {
    Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())
}

fn write_timestamp<W: Write>(mut writer: W, timestamp: Option<u64>) -> std::io::Result<()> {
    Optional::write(&mut writer, timestamp, |w, timestamp| {
        w.write_u64::<LittleEndian>(timestamp)
    })
}

impl TreeMetadata {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let scanned_height = reader.read_u64::<LittleEndian>()?;
        let invalid_merkleroot_details = Optional::read(&mut reader, |r| {
            let position = r.read_u64::<LittleEndian>()?;
            let block_number = r.read_u64::<LittleEndian>()?;

            Ok(InvalidMerklerootDetails {
                position,
                block_number,
            })
        })?;

        Ok(Self {
            scanned_height,
            invalid_merkleroot_details,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        writer.write_u64::<LittleEndian>(self.scanned_height)?;
        Optional::write(&mut writer, self.invalid_merkleroot_details, |w, details| {
            w.write_u64::<LittleEndian>(details.position)?;
            w.write_u64::<LittleEndian>(details.block_number)
        })
    }
}

impl TokenData {
    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let token_type = TokenType::from_u8(reader.read_u8()?)?;
        let token_address = read_address(&mut reader)?;
        let token_sub_id = read_node(&mut reader)?;

        Ok(Self {
            token_type,
            token_address,
            token_sub_id,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(self.token_type.to_u8())?;
        writer.write_all(&self.token_address)?;
        write_node(&mut writer, &self.token_sub_id)
    }
}

impl CommitmentPreimage {
    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let npk = read_node(&mut reader)?;
        let token = TokenData::read(&mut reader)?;
        let value = reader.read_u128::<LittleEndian>()?;

        Ok(Self { npk, token, value })
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        write_node(&mut writer, &self.npk)?;
        self.token.write(&mut writer)?;
        writer.write_u128::<LittleEndian>(self.value)
    }
}

impl Commitment {
    fn serialized_version() -> u8 {
        0
    }
}

impl LeafData for Commitment {
    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let hash = read_node(&mut reader)?;
        let txid = read_node(&mut reader)?;
        let block_number = reader.read_u64::<LittleEndian>()?;
        let timestamp = read_timestamp(&mut reader)?;
        let kind = match reader.read_u8()? {
            0 => {
                let preimage = CommitmentPreimage::read(&mut reader)?;
                let encrypted_bundle = read_bytes(&mut reader)?;
                let shield_key = read_node(&mut reader)?;

                CommitmentKind::Shield {
                    preimage,
                    encrypted_bundle,
                    shield_key,
                }
            }
            1 => CommitmentKind::Transact {
                ciphertext: read_bytes(&mut reader)?,
            },
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid commitment kind",
                ));
            }
        };

        Ok(Self {
            hash,
            txid,
            block_number,
            timestamp,
            kind,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        write_node(&mut writer, &self.hash)?;
        write_node(&mut writer, &self.txid)?;
        writer.write_u64::<LittleEndian>(self.block_number)?;
        write_timestamp(&mut writer, self.timestamp)?;
        match &self.kind {
            CommitmentKind::Shield {
                preimage,
                encrypted_bundle,
                shield_key,
            } => {
                writer.write_u8(0)?;
                preimage.write(&mut writer)?;
                write_bytes(&mut writer, encrypted_bundle)?;
                write_node(&mut writer, shield_key)
            }
            CommitmentKind::Transact { ciphertext } => {
                writer.write_u8(1)?;
                write_bytes(&mut writer, ciphertext)
            }
        }
    }
}

impl Nullifier {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let nullifier = read_node(&mut reader)?;
        let tree_number = reader.read_u32::<LittleEndian>()?;
        let txid = read_node(&mut reader)?;
        let block_number = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            nullifier,
            tree_number,
            txid,
            block_number,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        write_node(&mut writer, &self.nullifier)?;
        writer.write_u32::<LittleEndian>(self.tree_number)?;
        write_node(&mut writer, &self.txid)?;
        writer.write_u64::<LittleEndian>(self.block_number)
    }
}

impl UnshieldEvent {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let txid = read_node(&mut reader)?;
        let event_log_index = reader.read_u64::<LittleEndian>()?;
        let to_address = read_address(&mut reader)?;
        let token = TokenData::read(&mut reader)?;
        let amount = reader.read_u128::<LittleEndian>()?;
        let fee = reader.read_u128::<LittleEndian>()?;
        let block_number = reader.read_u64::<LittleEndian>()?;
        let timestamp = read_timestamp(&mut reader)?;

        Ok(Self {
            txid,
            event_log_index,
            to_address,
            token,
            amount,
            fee,
            block_number,
            timestamp,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        write_node(&mut writer, &self.txid)?;
        writer.write_u64::<LittleEndian>(self.event_log_index)?;
        writer.write_all(&self.to_address)?;
        self.token.write(&mut writer)?;
        writer.write_u128::<LittleEndian>(self.amount)?;
        writer.write_u128::<LittleEndian>(self.fee)?;
        writer.write_u64::<LittleEndian>(self.block_number)?;
        write_timestamp(&mut writer, self.timestamp)
    }
}

impl TransactionRecord {
    fn serialized_version() -> u8 {
        0
    }
}

impl LeafData for TransactionRecord {
    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let txid = read_node(&mut reader)?;
        let commitments = Vector::read(&mut reader, |r| read_node(r))?;
        let nullifiers = Vector::read(&mut reader, |r| read_node(r))?;
        let bound_params_hash = read_node(&mut reader)?;
        let unshield = Optional::read(&mut reader, |r| CommitmentPreimage::read(r))?;
        let utxo_tree_in = reader.read_u32::<LittleEndian>()?;
        let utxo_tree_out = reader.read_u32::<LittleEndian>()?;
        let utxo_batch_start_position_out = reader.read_u64::<LittleEndian>()?;
        let block_number = reader.read_u64::<LittleEndian>()?;
        let timestamp = read_timestamp(&mut reader)?;

        Ok(Self {
            txid,
            commitments,
            nullifiers,
            bound_params_hash,
            unshield,
            utxo_tree_in,
            utxo_tree_out,
            utxo_batch_start_position_out,
            block_number,
            timestamp,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        write_node(&mut writer, &self.txid)?;
        Vector::write(&mut writer, &self.commitments, |w, node| write_node(w, node))?;
        Vector::write(&mut writer, &self.nullifiers, |w, node| write_node(w, node))?;
        write_node(&mut writer, &self.bound_params_hash)?;
        Optional::write(&mut writer, self.unshield.as_ref(), |w, preimage| {
            preimage.write(w)
        })?;
        writer.write_u32::<LittleEndian>(self.utxo_tree_in)?;
        writer.write_u32::<LittleEndian>(self.utxo_tree_out)?;
        writer.write_u64::<LittleEndian>(self.utxo_batch_start_position_out)?;
        writer.write_u64::<LittleEndian>(self.block_number)?;
        write_timestamp(&mut writer, self.timestamp)
    }
}

impl PoiLaunchSnapshot {
    fn serialized_version() -> u8 {
        0
    }

    /// Deserialize into `reader`
    pub fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let tree = reader.read_u32::<LittleEndian>()?;
        let index = reader.read_u64::<LittleEndian>()?;
        let mut nodes = [Node::default(); TREE_DEPTH + 1];
        for node in nodes.iter_mut() {
            *node = read_node(&mut reader)?;
        }

        Ok(Self { tree, index, nodes })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        writer.write_u32::<LittleEndian>(self.tree)?;
        writer.write_u64::<LittleEndian>(self.index)?;
        for node in &self.nodes {
            write_node(&mut writer, node)?;
        }

        Ok(())
    }
}
