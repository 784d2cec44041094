//! Misc constants, copied from PostgreSQL headers.
//!
//! Any constants included here must be the same in all PostgreSQL versions and unlikely to change
//! in the future either!

use crate::BlockNumber;

// From pg_tablespace_d.h
pub const DEFAULTTABLESPACE_OID: u32 = 1663;

/// Size of one page of relation or SLRU storage, BLCKSZ in pg_config.h
pub const BLCKSZ: u16 = 8192;

// From block.h
pub const MAX_BLOCK_NUMBER: BlockNumber = 0xFFFF_FFFE;

// From slru.h
pub const SLRU_PAGES_PER_SEGMENT: u32 = 32;
pub const SLRU_SEG_SIZE: usize = BLCKSZ as usize * SLRU_PAGES_PER_SEGMENT as usize;
