//! Accessors for the few fields of the standard page header (bufpage.h) that the
//! storage manager needs to look at. Pages are handled as raw byte slices.
//!
//! ```text
//! typedef struct PageHeaderData
//! {
//!     PageXLogRecPtr pd_lsn;      /* offset 0: xlogid u32, xrecoff u32 */
//!     uint16      pd_checksum;    /* offset 8 */
//!     uint16      pd_flags;       /* offset 10 */
//!     LocationIndex pd_lower;     /* offset 12 */
//!     LocationIndex pd_upper;     /* offset 14 */
//!     ...
//! ```
//!
//! Fields are stored in the machine's byte order; like the rest of the
//! system we only support little-endian hosts.

use byteorder::{ByteOrder, LittleEndian};

const PD_LSN_OFFSET: usize = 0;
const SIZE_OF_PAGE_HEADER: usize = 24;

/// LSN of the last WAL record that modified this page.
pub fn page_get_lsn(page: &[u8]) -> u64 {
    if page.len() < SIZE_OF_PAGE_HEADER {
        return 0;
    }
    let xlogid = LittleEndian::read_u32(&page[PD_LSN_OFFSET..]);
    let xrecoff = LittleEndian::read_u32(&page[PD_LSN_OFFSET + 4..]);
    ((xlogid as u64) << 32) | xrecoff as u64
}

/// Stamp the page with an LSN. Slices too short to hold a header are left
/// alone.
pub fn page_set_lsn(page: &mut [u8], lsn: u64) {
    if page.len() < SIZE_OF_PAGE_HEADER {
        return;
    }
    LittleEndian::write_u32(&mut page[PD_LSN_OFFSET..], (lsn >> 32) as u32);
    LittleEndian::write_u32(&mut page[PD_LSN_OFFSET + 4..], lsn as u32);
}

pub fn page_is_all_zeros(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}
