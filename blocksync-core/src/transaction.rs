//! On-disk activity-log transaction format.
//!
//! One transaction is exactly one 4 KiB metadata block, big-endian, with a
//! CRC32C guarding the whole block (computed with the CRC field itself
//! zeroed). See [`AlTransaction::serialize`] / [`AlTransaction::deserialize`].

use blocksync_device::{Block, BLOCK_SIZE};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

/// Magic number identifying a valid on-disk AL transaction block.
pub const AL_MAGIC: u32 = 0x8620_1701;

/// Number of slot updates one transaction can carry.
pub const AL_UPDATES_PER_TRANSACTION: usize = 64;
/// Number of context entries one transaction can carry.
pub const AL_CONTEXT_PER_TRANSACTION: usize = 919;

/// Normal incremental update.
pub const AL_TR_UPDATE: u16 = 0;
/// Reserved transaction type for the very first write to a slot.
pub const AL_TR_INITIALIZED: u16 = 0xFFFF;

/// Sentinel `update_slot_nr` entry meaning "no update in this slot".
pub const NO_UPDATE_SLOT: u16 = 0xFFFF;

const OFF_MAGIC: usize = 0;
const OFF_TR_NUMBER: usize = 4;
const OFF_CRC: usize = 8;
const OFF_TYPE: usize = 12;
const OFF_N_UPDATES: usize = 14;
const OFF_CONTEXT_SIZE: usize = 16;
const OFF_CONTEXT_START: usize = 18;
#[allow(dead_code)]
const OFF_RESERVED: usize = 20;
const OFF_SLOTS: usize = 36;
const OFF_EXTENTS: usize = OFF_SLOTS + 2 * AL_UPDATES_PER_TRANSACTION;
const OFF_CONTEXT: usize = OFF_EXTENTS + 4 * AL_UPDATES_PER_TRANSACTION;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// One slot update: install `extent_nr` (or [`crate::geometry::LC_FREE`]) at
/// LRU index `slot_nr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpdate {
    /// LRU slot index being updated.
    pub slot_nr: u16,
    /// Extent number newly installed at that slot.
    pub extent_nr: u32,
}

/// A fully-populated on-disk AL transaction.
#[derive(Debug, Clone)]
pub struct AlTransaction {
    /// Monotonically increasing transaction sequence number.
    pub tr_number: u32,
    /// `AL_TR_UPDATE` for all transactions this crate writes.
    pub transaction_type: u16,
    /// Number of valid entries in `updates`.
    pub n_updates: u16,
    /// Total element count of the AL LRU at the time of writing (used to
    /// bound the cyclic context walk on replay).
    pub context_size: u16,
    /// Index of the first context entry carried in this transaction.
    pub context_start_slot_nr: u16,
    /// Slot updates, padded with `(NO_UPDATE_SLOT, LC_FREE)` past `n_updates`.
    pub updates: [SlotUpdate; AL_UPDATES_PER_TRANSACTION],
    /// Cyclic snapshot of `context_size` LRU slots' installed extent
    /// numbers, `context_size - context_start_slot_nr` of them valid here.
    pub context: Box<[u32; AL_CONTEXT_PER_TRANSACTION]>,
}

impl AlTransaction {
    /// Serialize into a 4 KiB big-endian block with a correct CRC32C.
    pub fn serialize(&self) -> Block {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&AL_MAGIC.to_be_bytes());
        buf[OFF_TR_NUMBER..OFF_TR_NUMBER + 4].copy_from_slice(&self.tr_number.to_be_bytes());
        buf[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&self.transaction_type.to_be_bytes());
        buf[OFF_N_UPDATES..OFF_N_UPDATES + 2].copy_from_slice(&self.n_updates.to_be_bytes());
        buf[OFF_CONTEXT_SIZE..OFF_CONTEXT_SIZE + 2]
            .copy_from_slice(&self.context_size.to_be_bytes());
        buf[OFF_CONTEXT_START..OFF_CONTEXT_START + 2]
            .copy_from_slice(&self.context_start_slot_nr.to_be_bytes());
        // OFF_RESERVED..OFF_SLOTS stays zero.

        for (i, update) in self.updates.iter().enumerate() {
            let so = OFF_SLOTS + 2 * i;
            buf[so..so + 2].copy_from_slice(&update.slot_nr.to_be_bytes());
            let eo = OFF_EXTENTS + 4 * i;
            buf[eo..eo + 4].copy_from_slice(&update.extent_nr.to_be_bytes());
        }
        for (i, ctx) in self.context.iter().enumerate() {
            let co = OFF_CONTEXT + 4 * i;
            buf[co..co + 4].copy_from_slice(&ctx.to_be_bytes());
        }

        // CRC field itself stays zero while computing.
        let crc = CRC32C.checksum(&buf);
        buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parse and validate a 4 KiB block, checking magic and CRC32C.
    pub fn deserialize(buf: &Block) -> Result<Self> {
        let magic = u32::from_be_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != AL_MAGIC {
            return Err(Error::invariant("bad AL transaction magic"));
        }
        let stored_crc = u32::from_be_bytes(buf[OFF_CRC..OFF_CRC + 4].try_into().unwrap());
        let mut check = *buf;
        check[OFF_CRC..OFF_CRC + 4].fill(0);
        let computed = CRC32C.checksum(&check);
        if computed != stored_crc {
            return Err(Error::invariant("AL transaction CRC mismatch"));
        }

        let tr_number =
            u32::from_be_bytes(buf[OFF_TR_NUMBER..OFF_TR_NUMBER + 4].try_into().unwrap());
        let transaction_type = u16::from_be_bytes(buf[OFF_TYPE..OFF_TYPE + 2].try_into().unwrap());
        let n_updates =
            u16::from_be_bytes(buf[OFF_N_UPDATES..OFF_N_UPDATES + 2].try_into().unwrap());
        let context_size = u16::from_be_bytes(
            buf[OFF_CONTEXT_SIZE..OFF_CONTEXT_SIZE + 2]
                .try_into()
                .unwrap(),
        );
        let context_start_slot_nr = u16::from_be_bytes(
            buf[OFF_CONTEXT_START..OFF_CONTEXT_START + 2]
                .try_into()
                .unwrap(),
        );

        let mut updates = [SlotUpdate {
            slot_nr: NO_UPDATE_SLOT,
            extent_nr: crate::geometry::LC_FREE,
        }; AL_UPDATES_PER_TRANSACTION];
        for (i, update) in updates.iter_mut().enumerate() {
            let so = OFF_SLOTS + 2 * i;
            let eo = OFF_EXTENTS + 4 * i;
            update.slot_nr = u16::from_be_bytes(buf[so..so + 2].try_into().unwrap());
            update.extent_nr = u32::from_be_bytes(buf[eo..eo + 4].try_into().unwrap());
        }

        let mut context = Box::new([0u32; AL_CONTEXT_PER_TRANSACTION]);
        for (i, ctx) in context.iter_mut().enumerate() {
            let co = OFF_CONTEXT + 4 * i;
            *ctx = u32::from_be_bytes(buf[co..co + 4].try_into().unwrap());
        }

        Ok(AlTransaction {
            tr_number,
            transaction_type,
            n_updates,
            context_size,
            context_start_slot_nr,
            updates,
            context,
        })
    }
}
